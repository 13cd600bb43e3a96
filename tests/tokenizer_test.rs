//! HuggingFace vocabularies: token bytes come from the vocabulary, so byte fragments
//! of multi-byte characters keep their raw bytes.

use genai_oxidized::{HfTokenizer, Tokenizer};

/// Byte-level BPE where "é" (C3 A9) is spelled "Ã©" and splits into one token per byte.
const BYTE_LEVEL: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    { "id": 5, "content": "<|end|>", "single_word": false, "lstrip": false,
      "rstrip": false, "normalized": false, "special": true }
  ],
  "normalizer": null,
  "pre_tokenizer": { "type": "ByteLevel", "add_prefix_space": false, "trim_offsets": true, "use_regex": true },
  "post_processor": null,
  "decoder": { "type": "ByteLevel", "add_prefix_space": false, "trim_offsets": true, "use_regex": true },
  "model": {
    "type": "BPE",
    "dropout": null,
    "unk_token": null,
    "continuing_subword_prefix": null,
    "end_of_word_suffix": null,
    "fuse_unk": false,
    "byte_fallback": false,
    "vocab": { "Ã": 0, "©": 1, "Ã©": 2, "Ġ": 3, "a": 4 },
    "merges": ["Ã ©"]
  }
}"#;

/// SentencePiece-style BPE with byte-fallback tokens and the `▁` space marker.
const SENTENCEPIECE: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": null,
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "BPE",
    "dropout": null,
    "unk_token": null,
    "continuing_subword_prefix": null,
    "end_of_word_suffix": null,
    "fuse_unk": false,
    "byte_fallback": true,
    "vocab": { "<0x41>": 0, "▁hi": 1, "h": 2, "i": 3, "▁": 4 },
    "merges": []
  }
}"#;

#[test]
fn byte_level_tokens_map_back_to_raw_bytes() {
    let tok = HfTokenizer::from_json(BYTE_LEVEL).unwrap();
    assert_eq!(tok.vocab_size(), 6);
    assert_eq!(tok.token_bytes(0), Some(vec![0xC3]));
    assert_eq!(tok.token_bytes(1), Some(vec![0xA9]));
    assert_eq!(tok.token_bytes(2), Some(vec![0xC3, 0xA9]));
    assert_eq!(tok.token_bytes(3), Some(vec![b' ']));
    assert_eq!(tok.token_bytes(5), Some(Vec::new()));
    assert_eq!(tok.token_bytes(99), None);
}

#[test]
fn byte_level_encode_and_decode() {
    let tok = HfTokenizer::from_json(BYTE_LEVEL).unwrap();
    assert_eq!(tok.encode("é".as_bytes()).unwrap(), vec![2]);
    assert_eq!(tok.encode(b" a").unwrap(), vec![3, 4]);
    assert_eq!(tok.decode(&[2]).unwrap(), "é");
}

#[test]
fn invalid_utf8_is_rejected_not_replaced() {
    let tok = HfTokenizer::from_json(BYTE_LEVEL).unwrap();
    assert!(tok.encode(&[0xC3]).is_err());
}

#[test]
fn sentencepiece_byte_fallback_and_space_marker() {
    let tok = HfTokenizer::from_json(SENTENCEPIECE).unwrap();
    assert_eq!(tok.token_bytes(0), Some(vec![0x41]));
    assert_eq!(tok.token_bytes(1), Some(b" hi".to_vec()));
    assert_eq!(tok.token_bytes(2), Some(b"h".to_vec()));
    assert_eq!(tok.token_bytes(4), Some(b" ".to_vec()));
}

#[cfg(feature = "guidance")]
#[test]
fn masks_allow_partial_character_tokens() {
    use std::sync::Arc;

    use genai_oxidized::inference::guidance::{ConstraintCompiler, RegexCompiler, TokenizerEnv};

    let tok = HfTokenizer::from_json(BYTE_LEVEL).unwrap();
    let env = Arc::new(TokenizerEnv::new(Arc::new(tok), 5).unwrap());
    let mut engine = RegexCompiler.compile("é", &env).unwrap();

    let mask = engine.compute_mask().unwrap();
    assert!(mask.is_allowed(0));
    assert!(mask.is_allowed(2));
    assert!(!mask.is_allowed(1));
    assert!(!mask.is_allowed(4));

    engine.commit_token(0).unwrap();
    let mask = engine.compute_mask().unwrap();
    assert_eq!(mask.allowed_tokens().collect::<Vec<_>>(), vec![1]);
}

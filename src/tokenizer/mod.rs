//! Tokenizer collaborator: byte-level access to the vocabulary for constrained
//! decoding, plus encode/decode for callers.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tokenizers::decoders::DecoderWrapper;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;

use crate::errors::{GenError, Result};

pub trait Tokenizer: Send + Sync {
    /// Encode raw bytes. Byte vocabularies accept any bytes; text models may reject
    /// invalid UTF-8.
    fn encode(&self, bytes: &[u8]) -> Result<Vec<i32>>;

    fn decode(&self, ids: &[i32]) -> Result<String>;

    /// Byte expansion of one token; empty for special tokens, `None` when out of range.
    fn token_bytes(&self, id: u32) -> Option<Vec<u8>>;

    fn vocab_size(&self) -> usize;
}

/// Greedy longest-match tokenizer over an explicit byte-string vocabulary.
///
/// Every single byte is a token, so any input encodes. Special tokens have no byte
/// expansion and are never produced by `encode`.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    tokens: Vec<Vec<u8>>,
    lookup: HashMap<Vec<u8>, i32>,
    max_token_len: usize,
}

impl ByteTokenizer {
    /// Layout: `specials` first, then the 256 single bytes, then `merges`.
    pub fn new<S: AsRef<[u8]>>(specials: usize, merges: &[S]) -> Self {
        let mut tokens: Vec<Vec<u8>> = vec![Vec::new(); specials];
        tokens.extend((0u8..=255).map(|b| vec![b]));
        for merge in merges {
            let bytes = merge.as_ref();
            if bytes.len() > 1 {
                tokens.push(bytes.to_vec());
            }
        }
        let lookup = tokens
            .iter()
            .enumerate()
            .filter(|(_, bytes)| !bytes.is_empty())
            .map(|(id, bytes)| (bytes.clone(), id as i32))
            .collect();
        let max_token_len = tokens.iter().map(Vec::len).max().unwrap_or(1);
        Self {
            tokens,
            lookup,
            max_token_len,
        }
    }

    /// Id of the single-byte token `b`.
    pub fn byte_token(&self, b: u8) -> i32 {
        self.lookup.get(&vec![b]).copied().unwrap_or(0)
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, bytes: &[u8]) -> Result<Vec<i32>> {
        let mut ids = Vec::with_capacity(bytes.len());
        let mut pos = 0;
        while pos < bytes.len() {
            let longest = (1..=self.max_token_len.min(bytes.len() - pos))
                .rev()
                .find_map(|len| self.lookup.get(&bytes[pos..pos + len]).map(|&id| (id, len)));
            let (id, len) = longest
                .ok_or_else(|| GenError::Tokenizer(format!("no token for byte {}", bytes[pos])))?;
            ids.push(id);
            pos += len;
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[i32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            let token = usize::try_from(id)
                .ok()
                .and_then(|i| self.tokens.get(i))
                .ok_or_else(|| GenError::Tokenizer(format!("token id {} out of range", id)))?;
            bytes.extend_from_slice(token);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_bytes(&self, id: u32) -> Option<Vec<u8>> {
        self.tokens.get(id as usize).cloned()
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }
}

/// HuggingFace `tokenizers` model behind the [`Tokenizer`] trait.
///
/// Token bytes come from the vocabulary strings, not from decoding: byte-level BPE
/// vocabularies spell each byte as one printable char, SentencePiece vocabularies use
/// `<0xNN>` byte-fallback tokens and `▁` for spaces.
pub struct HfTokenizer {
    tokenizer: tokenizers::Tokenizer,
    byte_level: Option<HashMap<char, u8>>,
    specials: HashSet<u32>,
}

impl HfTokenizer {
    /// Load tokenizer from a JSON file (e.g. tokenizer.json).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| GenError::Tokenizer(e.to_string()))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Parse the contents of a tokenizer.json.
    pub fn from_json(json: &str) -> Result<Self> {
        let tokenizer = json
            .parse::<tokenizers::Tokenizer>()
            .map_err(|e| GenError::Tokenizer(e.to_string()))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    pub fn from_tokenizer(tokenizer: tokenizers::Tokenizer) -> Self {
        let byte_level = matches!(
            tokenizer.get_decoder(),
            Some(DecoderWrapper::ByteLevel(_))
        ) || matches!(
            tokenizer.get_pre_tokenizer(),
            Some(PreTokenizerWrapper::ByteLevel(_))
        );
        let specials = tokenizer
            .get_added_tokens_decoder()
            .into_iter()
            .filter(|(_, token)| token.special)
            .map(|(id, _)| id)
            .collect();
        Self {
            tokenizer,
            byte_level: byte_level.then(byte_level_chars),
            specials,
        }
    }
}

/// Inverse of the GPT-2 byte-to-unicode table: printable Latin-1 bytes map to
/// themselves, the rest to consecutive code points from U+0100.
fn byte_level_chars() -> HashMap<char, u8> {
    let mut shifted = 0u32;
    (0u8..=255)
        .filter_map(|b| {
            let code = if matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF) {
                u32::from(b)
            } else {
                shifted += 1;
                255 + shifted
            };
            char::from_u32(code).map(|c| (c, b))
        })
        .collect()
}

fn byte_fallback(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

impl Tokenizer for HfTokenizer {
    /// Fails on invalid UTF-8; HuggingFace models only encode text.
    fn encode(&self, bytes: &[u8]) -> Result<Vec<i32>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| GenError::Tokenizer(format!("input is not valid UTF-8: {}", e)))?;
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| GenError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i32).collect())
    }

    fn decode(&self, ids: &[i32]) -> Result<String> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| GenError::Tokenizer(e.to_string()))
    }

    fn token_bytes(&self, id: u32) -> Option<Vec<u8>> {
        let piece = self.tokenizer.id_to_token(id)?;
        if self.specials.contains(&id) {
            return Some(Vec::new());
        }
        if let Some(table) = &self.byte_level {
            let mapped: Option<Vec<u8>> = piece.chars().map(|c| table.get(&c).copied()).collect();
            // Added tokens are stored as plain text.
            return Some(mapped.unwrap_or_else(|| piece.into_bytes()));
        }
        if let Some(b) = byte_fallback(&piece) {
            return Some(vec![b]);
        }
        Some(piece.replace('\u{2581}', " ").into_bytes())
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_match_encoding() {
        let tok = ByteTokenizer::new(3, &["ab", "abc", "c"]);
        assert_eq!(tok.vocab_size(), 3 + 256 + 2);
        let ids = tok.encode(b"abcab").unwrap();
        assert_eq!(ids, vec![3 + 256 + 1, 3 + 256]);
        assert_eq!(tok.decode(&ids).unwrap(), "abcab");
    }

    #[test]
    fn specials_have_no_bytes() {
        let tok = ByteTokenizer::new(2, &[] as &[&str]);
        assert_eq!(tok.token_bytes(1), Some(Vec::new()));
        assert_eq!(tok.token_bytes(2), Some(vec![0]));
        assert_eq!(tok.byte_token(b'a'), 2 + b'a' as i32);
        assert!(tok.decode(&[9999]).is_err());
    }
}

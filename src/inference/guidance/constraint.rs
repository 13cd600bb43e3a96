//! Constraint-engine contract and the tokenizer environment engines compile against.

use std::collections::HashMap;
use std::sync::Arc;

use super::tokenize_partial;
use crate::errors::{GenError, Result};
use crate::kernels::TokenMask;
use crate::tokenizer::Tokenizer;

/// One row's grammar state.
pub trait ConstraintEngine: Send {
    /// Tokens allowed at the next position, over the tokenizer vocabulary.
    fn compute_mask(&mut self) -> Result<TokenMask>;

    /// Advance by one accepted token. Fails when the token violates the constraint.
    fn commit_token(&mut self, token: u32) -> Result<()>;

    fn reset(&mut self);

    /// True once the end-of-sequence token has been accepted.
    fn is_stopped(&self) -> bool;
}

/// Turns grammar text into a fresh [`ConstraintEngine`].
pub trait ConstraintCompiler: Send + Sync {
    fn compile(&self, data: &str, env: &Arc<TokenizerEnv>) -> Result<Box<dyn ConstraintEngine>>;
}

/// Custom compilers keyed by guidance type.
pub type CompilerRegistry = HashMap<String, Arc<dyn ConstraintCompiler>>;

#[derive(Debug, Default)]
struct TrieNode {
    children: Vec<(u8, usize)>,
    tokens: Vec<u32>,
}

/// Byte trie over the vocabulary; tokens sharing a prefix share a path.
#[derive(Debug, Default)]
pub struct TokenTrie {
    nodes: Vec<TrieNode>,
}

impl TokenTrie {
    pub fn new<'a>(tokens: impl IntoIterator<Item = (u32, &'a [u8])>) -> Self {
        let mut trie = Self {
            nodes: vec![TrieNode::default()],
        };
        for (id, bytes) in tokens {
            if bytes.is_empty() {
                continue;
            }
            let mut node = 0;
            for &b in bytes {
                node = match trie.nodes[node].children.iter().find(|(c, _)| *c == b) {
                    Some(&(_, child)) => child,
                    None => {
                        trie.nodes.push(TrieNode::default());
                        let child = trie.nodes.len() - 1;
                        trie.nodes[node].children.push((b, child));
                        child
                    }
                };
            }
            trie.nodes[node].tokens.push(id);
        }
        trie
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Depth-first walk from the root carrying a matcher state. `step` advances the
    /// state by one byte and returns `None` to prune the subtree; `accept` is called for
    /// every token whose full byte string was consumed.
    pub fn walk<S>(
        &self,
        start: S,
        mut step: impl FnMut(&S, u8) -> Option<S>,
        mut accept: impl FnMut(u32),
    ) {
        let mut stack = vec![(0usize, start)];
        while let Some((node, state)) = stack.pop() {
            for &(byte, child) in &self.nodes[node].children {
                if let Some(next) = step(&state, byte) {
                    self.nodes[child].tokens.iter().for_each(|&t| accept(t));
                    stack.push((child, next));
                }
            }
        }
    }
}

/// Vocabulary view shared by every row's engine.
pub struct TokenizerEnv {
    tokenizer: Arc<dyn Tokenizer>,
    token_bytes: Vec<Vec<u8>>,
    trie: TokenTrie,
    eos_token: u32,
    prefix_len: usize,
}

impl TokenizerEnv {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, eos_token: u32) -> Result<Self> {
        let vocab_size = tokenizer.vocab_size();
        if eos_token as usize >= vocab_size {
            return Err(GenError::InvalidArgument(format!(
                "eos token {} outside tokenizer vocabulary of {}",
                eos_token, vocab_size
            )));
        }
        let token_bytes: Vec<Vec<u8>> = (0..vocab_size as u32)
            .map(|id| tokenizer.token_bytes(id).unwrap_or_default())
            .collect();
        let trie = TokenTrie::new(
            token_bytes
                .iter()
                .enumerate()
                .filter(|(id, _)| *id as u32 != eos_token)
                .map(|(id, bytes)| (id as u32, bytes.as_slice())),
        );
        let prefix_len = tokenizer.encode(super::TOKENIZE_PREFIX)?.len();
        Ok(Self {
            tokenizer,
            token_bytes,
            trie,
            eos_token,
            prefix_len,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.token_bytes.len()
    }

    pub fn eos_token(&self) -> u32 {
        self.eos_token
    }

    /// Byte expansion of `token`; empty for special and unknown tokens.
    pub fn token_bytes(&self, token: u32) -> &[u8] {
        self.token_bytes
            .get(token as usize)
            .map_or(&[], Vec::as_slice)
    }

    pub fn trie(&self) -> &TokenTrie {
        &self.trie
    }

    /// Tokenize a byte fragment that may start mid-word or mid-character.
    pub fn tokenize_bytes(&self, bytes: &[u8]) -> Result<Vec<i32>> {
        tokenize_partial(self.tokenizer.as_ref(), self.prefix_len, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trie_walk_prunes_and_accepts() {
        let vocab: Vec<(u32, &[u8])> = vec![
            (0, b"a"),
            (1, b"ab"),
            (2, b"abc"),
            (3, b"b"),
            (4, b""),
        ];
        let trie = TokenTrie::new(vocab);
        assert_eq!(trie.num_nodes(), 5);

        // Allow only the bytes "ab", consumed in order.
        let mut accepted = Vec::new();
        trie.walk(
            0usize,
            |&pos, b| (b"ab".get(pos) == Some(&b)).then_some(pos + 1),
            |t| accepted.push(t),
        );
        accepted.sort_unstable();
        assert_eq!(accepted, vec![0, 1]);
    }
}

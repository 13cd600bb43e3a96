//! Vocabulary bitmasks and the row-parallel mask merge kernel.
//!
//! Bit `t % 32` of word `t / 32` is set when token `t` is allowed. A `[rows, vocab]`
//! logits block pairs with a `[rows, words_per_row(vocab)]` word block.

use rayon::prelude::*;

/// Number of `u32` words needed for one row of a `vocab_size` mask.
#[inline]
pub fn words_per_row(vocab_size: usize) -> usize {
    vocab_size.div_ceil(32)
}

/// One row's allowed-token bitset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMask {
    words: Vec<u32>,
    vocab_size: usize,
}

impl TokenMask {
    pub fn allow_all(vocab_size: usize) -> Self {
        let mut words = vec![u32::MAX; words_per_row(vocab_size)];
        let remainder = vocab_size % 32;
        if remainder > 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u32 << remainder) - 1;
            }
        }
        Self { words, vocab_size }
    }

    pub fn block_all(vocab_size: usize) -> Self {
        Self {
            words: vec![0; words_per_row(vocab_size)],
            vocab_size,
        }
    }

    pub fn from_allowed(vocab_size: usize, allowed: impl IntoIterator<Item = u32>) -> Self {
        let mut mask = Self::block_all(vocab_size);
        for token in allowed {
            mask.allow(token);
        }
        mask
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn is_allowed(&self, token: u32) -> bool {
        let t = token as usize;
        t < self.vocab_size && (self.words[t / 32] >> (t % 32)) & 1 == 1
    }

    /// Out-of-vocabulary tokens are ignored.
    pub fn allow(&mut self, token: u32) {
        let t = token as usize;
        if t < self.vocab_size {
            self.words[t / 32] |= 1 << (t % 32);
        }
    }

    pub fn block(&mut self, token: u32) {
        let t = token as usize;
        if t < self.vocab_size {
            self.words[t / 32] &= !(1 << (t % 32));
        }
    }

    pub fn num_allowed(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn allowed_tokens(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.vocab_size as u32).filter(|&t| self.is_allowed(t))
    }

    /// Keep only tokens allowed by both masks.
    pub fn intersect(&mut self, other: &TokenMask) {
        debug_assert_eq!(self.vocab_size, other.vocab_size);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= *b;
        }
    }

    /// Resize to a logits row of `vocab_size` entries; new tokens are blocked.
    pub fn resized(mut self, vocab_size: usize) -> Self {
        if vocab_size < self.vocab_size {
            let mut out = Self::block_all(vocab_size);
            for t in self.allowed_tokens().filter(|&t| (t as usize) < vocab_size) {
                out.allow(t);
            }
            return out;
        }
        self.words.resize(words_per_row(vocab_size), 0);
        self.vocab_size = vocab_size;
        self
    }
}

/// Overwrite every logit whose mask bit is clear with negative infinity.
///
/// Rows are processed in parallel. `logits.len()` must be `rows * vocab_size` and
/// `mask.len()` must be `rows * words_per_row(vocab_size)`.
pub fn apply_token_mask(logits: &mut [f32], mask: &[u32], vocab_size: usize) {
    let words = words_per_row(vocab_size);
    if vocab_size == 0 {
        return;
    }
    debug_assert_eq!(logits.len() / vocab_size, mask.len() / words.max(1));

    logits
        .par_chunks_mut(vocab_size)
        .zip(mask.par_chunks(words))
        .for_each(|(row, row_mask)| {
            for (block, &word) in row.chunks_mut(32).zip(row_mask) {
                if word == u32::MAX {
                    continue;
                }
                for (bit, logit) in block.iter_mut().enumerate() {
                    if (word >> bit) & 1 == 0 {
                        *logit = f32::NEG_INFINITY;
                    }
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_clears_tail_bits() {
        let m = TokenMask::allow_all(40);
        assert_eq!(m.words(), &[u32::MAX, 0xFF]);
        assert_eq!(m.num_allowed(), 40);
        assert!(!m.is_allowed(40));
    }

    #[test]
    fn allow_block_and_intersect() {
        let mut a = TokenMask::from_allowed(70, [1, 33, 69, 500]);
        assert_eq!(a.allowed_tokens().collect::<Vec<_>>(), vec![1, 33, 69]);
        a.block(33);
        let b = TokenMask::from_allowed(70, [1, 2, 33]);
        a.intersect(&b);
        assert_eq!(a.allowed_tokens().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn resize_blocks_new_tokens() {
        let m = TokenMask::allow_all(30).resized(64);
        assert_eq!(m.num_allowed(), 30);
        let m = TokenMask::allow_all(64).resized(10);
        assert_eq!(m.num_allowed(), 10);
    }

    #[test]
    fn apply_mask_two_rows() {
        let vocab = 5;
        let mut logits = vec![1.0f32; vocab * 2];
        let r0 = TokenMask::from_allowed(vocab, [0, 4]);
        let r1 = TokenMask::from_allowed(vocab, [2]);
        let words: Vec<u32> = r0.words().iter().chain(r1.words()).copied().collect();
        apply_token_mask(&mut logits, &words, vocab);
        let ninf = f32::NEG_INFINITY;
        assert_eq!(logits, vec![1.0, ninf, ninf, ninf, 1.0, ninf, ninf, 1.0, ninf, ninf]);
    }
}

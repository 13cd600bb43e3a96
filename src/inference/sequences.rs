//! Device-resident token sequences, one row per batch entry and beam.

use std::sync::Arc;

use crate::device::{DeviceInterface, DeviceSpan};
use crate::errors::{GenError, Result};

/// `[rows, max_length]` i32 token buffer with one shared current length.
#[derive(Debug)]
pub struct Sequences {
    buffer: DeviceSpan<i32>,
    rows: usize,
    max_length: usize,
    current_length: usize,
}

impl Sequences {
    pub fn new(device: &Arc<dyn DeviceInterface>, rows: usize, max_length: usize) -> Result<Self> {
        let count = rows
            .checked_mul(max_length)
            .ok_or_else(|| GenError::invalid_argument("sequence buffer size overflows usize"))?;
        Ok(Self {
            buffer: device.allocate::<i32>(count)?,
            rows,
            max_length,
            current_length: 0,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn current_length(&self) -> usize {
        self.current_length
    }

    /// Append `per_row` tokens to every row; `tokens` is `[rows, per_row]` row-major.
    pub fn append(&mut self, tokens: &[i32], per_row: usize) -> Result<()> {
        if tokens.len() != self.rows * per_row {
            return Err(GenError::InvalidArgument(format!(
                "expected {} tokens for {} rows, got {}",
                self.rows * per_row,
                self.rows,
                tokens.len()
            )));
        }
        if self.current_length + per_row > self.max_length {
            return Err(GenError::InvalidArgument(format!(
                "sequence length {} would exceed max_length {}",
                self.current_length + per_row,
                self.max_length
            )));
        }
        if per_row == 0 {
            return Ok(());
        }
        for (row, chunk) in tokens.chunks(per_row).enumerate() {
            self.buffer
                .subspan(row * self.max_length + self.current_length, per_row)?
                .copy_from_cpu(chunk)?;
        }
        self.current_length += per_row;
        Ok(())
    }

    /// Truncate every row to `length` tokens.
    pub fn rewind_to(&mut self, length: usize) -> Result<()> {
        if length > self.current_length {
            return Err(GenError::InvalidArgument(format!(
                "cannot rewind to {} past current length {}",
                length, self.current_length
            )));
        }
        self.current_length = length;
        Ok(())
    }

    /// Read-only device view of one row's committed tokens.
    pub fn sequence(&self, row: usize) -> Result<DeviceSpan<i32>> {
        if row >= self.rows {
            return Err(GenError::InvalidArgument(format!(
                "row {} out of range for {} rows",
                row, self.rows
            )));
        }
        self.buffer.subspan(row * self.max_length, self.current_length)
    }

    /// Host copy of positions `begin..current_length` for every row, `[rows, n]` row-major.
    pub fn tail(&self, begin: usize) -> Vec<i32> {
        let begin = begin.min(self.current_length);
        let width = self.current_length - begin;
        let host = self.buffer.to_cpu();
        let mut out = Vec::with_capacity(self.rows * width);
        for row in 0..self.rows {
            let start = row * self.max_length + begin;
            out.extend_from_slice(&host[start..start + width]);
        }
        out
    }

    /// Host copy of one row's committed tokens.
    pub fn row_tokens(&self, row: usize) -> Result<Vec<i32>> {
        Ok(self.sequence(row)?.to_cpu())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{create_device, DeviceOptions, DeviceType};

    #[test]
    fn append_rewind_and_views() {
        let dev = create_device(DeviceType::Cuda, &DeviceOptions::default());
        let mut seq = Sequences::new(&dev, 2, 4).unwrap();
        seq.append(&[1, 2, 5, 6], 2).unwrap();
        seq.append(&[3, 7], 1).unwrap();
        assert_eq!(seq.row_tokens(0).unwrap(), vec![1, 2, 3]);
        assert_eq!(seq.row_tokens(1).unwrap(), vec![5, 6, 7]);
        assert_eq!(seq.tail(1), vec![2, 3, 6, 7]);

        assert!(seq.append(&[0, 0, 0, 0], 2).is_err());
        assert!(seq.rewind_to(4).is_err());
        seq.rewind_to(1).unwrap();
        assert_eq!(seq.sequence(1).unwrap().len(), 1);
        assert!(seq.sequence(2).is_err());
    }
}

//! Streaming generation via async channels.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::inference::Generator;

/// Event emitted during streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationToken {
    /// One token selected for `row`. `text` is set when the model has a tokenizer.
    Token {
        row: usize,
        id: i32,
        text: Option<String>,
    },
    Done { total_tokens: usize, time_ms: f64 },
    Error(String),
}

/// Drives a [`Generator`] to completion on a blocking thread and sends every token
/// over a channel.
pub struct StreamGenerator {
    generator: Generator,
    capacity: usize,
}

impl StreamGenerator {
    pub fn new(generator: Generator) -> Self {
        Self {
            generator,
            capacity: 128,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Start generation; must be called from within a tokio runtime. Generation stops
    /// early when the receiver is dropped.
    pub fn spawn(self) -> mpsc::Receiver<GenerationToken> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut generator = self.generator;
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            match run_to_completion(&mut generator, &tx) {
                Ok(Some(total_tokens)) => {
                    let _ = tx.blocking_send(GenerationToken::Done {
                        total_tokens,
                        time_ms: start.elapsed().as_secs_f64() * 1000.0,
                    });
                }
                Ok(None) => debug!("stream receiver dropped; generation stopped"),
                Err(e) => {
                    warn!(error = %e, "streaming generation failed");
                    let _ = tx.blocking_send(GenerationToken::Error(e.to_string()));
                }
            }
        });
        rx
    }
}

/// Returns the number of tokens sent, or `None` when the receiver went away.
fn run_to_completion(
    generator: &mut Generator,
    tx: &mpsc::Sender<GenerationToken>,
) -> Result<Option<usize>> {
    let rows = generator.rows();
    let tokenizer = generator.model().tokenizer().cloned();
    let mut sent = 0;
    while !generator.is_done() {
        let was_done: Vec<bool> = (0..rows).map(|r| generator.is_row_done(r)).collect();
        generator.generate_next_token()?;
        let position = generator.sequence_length() - 1;
        for (row, _) in was_done.iter().enumerate().filter(|&(_, &d)| !d) {
            let id = generator.get_sequence(row)?.to_cpu()[position];
            let text = tokenizer.as_ref().and_then(|t| t.decode(&[id]).ok());
            if tx
                .blocking_send(GenerationToken::Token { row, id, text })
                .is_err()
            {
                return Ok(None);
            }
            sent += 1;
        }
    }
    Ok(Some(sent))
}

//! Incremental reply delivery, decoupled from persistence.
//!
//! The dispatcher writes the full reply to the store as a single unit; the
//! emitter only replays that completed text as a finite, lazy sequence of
//! increments at a fixed cadence. Dropping the stream cancels production of
//! further increments and leaves the persisted message untouched. A stream
//! is not restartable; calling [`StreamEmitter::emit`] again re-emits from
//! the start.

use std::time::Duration;

use async_stream::stream;
use futures::Stream;

/// Increment size and pacing for the typing effect.
#[derive(Debug, Clone, Copy)]
pub struct EmitterConfig {
    /// Characters revealed per increment.
    pub chunk_chars: usize,
    /// Delay between consecutive increments.
    pub cadence: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            chunk_chars: 1,
            cadence: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamEmitter {
    config: EmitterConfig,
}

impl StreamEmitter {
    pub fn new(config: EmitterConfig) -> Self {
        Self { config }
    }

    /// Replay `reply` as ordered text increments. The first increment is
    /// produced immediately; each following one waits out the cadence.
    pub fn emit(&self, reply: &str) -> impl Stream<Item = String> + Send {
        let chunks = chunk_text(reply, self.config.chunk_chars.max(1));
        let cadence = self.config.cadence;
        stream! {
            for (index, chunk) in chunks.into_iter().enumerate() {
                if index > 0 && !cadence.is_zero() {
                    tokio::time::sleep(cadence).await;
                }
                yield chunk;
            }
        }
    }
}

// Split on character boundaries; a chunk never bisects a multi-byte char.
fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

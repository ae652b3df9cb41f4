//! Batch evaluation: feeds pending tokens to the backend in bounded chunks.
//!
//! A `DecodeStream` is one backend context plus the number of tokens already
//! resident in it. The main stream and the guidance stream are two instances
//! of the same type; they differ only in the context they decode into.

use crate::backend::{Backend, BackendError, StreamKind, Token};
use thiserror::Error;
use tracing::{debug, trace};

/// A chunk failed to decode.
///
/// Chunks before the failing one were committed; `evaluated` says how many
/// tokens that was and `position` is the position the stream reached.
#[derive(Debug, Error)]
#[error("failed to decode {n_tokens} tokens at position {position} on {stream:?} stream")]
pub struct DecodeError {
    pub stream: StreamKind,
    pub position: i32,
    pub n_tokens: usize,
    pub evaluated: usize,
    #[source]
    pub source: BackendError,
}

/// Decode `tokens` starting at `start`, at most `n_batch` tokens per call.
///
/// Returns the position after the last token.
pub fn evaluate<B: Backend + ?Sized>(
    backend: &mut B,
    stream: StreamKind,
    tokens: &[Token],
    start: i32,
    n_batch: usize,
) -> Result<i32, DecodeError> {
    let mut position = start;
    let mut evaluated = 0usize;

    for chunk in tokens.chunks(n_batch.max(1)) {
        trace!(?stream, position, n_eval = chunk.len(), "eval");
        backend
            .decode(stream, chunk, position)
            .map_err(|source| DecodeError {
                stream,
                position,
                n_tokens: chunk.len(),
                evaluated,
                source,
            })?;
        position += chunk.len() as i32;
        evaluated += chunk.len();
    }

    Ok(position)
}

/// One decode stream and its resident-token counter.
#[derive(Debug, Clone)]
pub struct DecodeStream {
    kind: StreamKind,
    n_past: i32,
}

impl DecodeStream {
    pub fn new(kind: StreamKind) -> Self {
        Self { kind, n_past: 0 }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Tokens already resident in the backend context.
    pub fn n_past(&self) -> i32 {
        self.n_past
    }

    /// Account for tokens that became resident without a decode (prefix reuse).
    pub fn advance(&mut self, n: i32) {
        self.n_past += n;
    }

    /// Account for tokens evicted from the front of the window.
    pub fn rewind(&mut self, n: i32) {
        self.n_past -= n;
    }

    pub fn reset(&mut self) {
        self.n_past = 0;
    }

    /// Decode `tokens` at the current position and advance past them.
    ///
    /// On failure the counter still covers the chunks that were committed.
    pub fn feed<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        tokens: &[Token],
        n_batch: usize,
    ) -> Result<(), DecodeError> {
        match evaluate(backend, self.kind, tokens, self.n_past, n_batch) {
            Ok(position) => {
                self.n_past = position;
                debug!(stream = ?self.kind, n_past = self.n_past, "evaluated");
                Ok(())
            }
            Err(e) => {
                self.n_past = e.position;
                Err(e)
            }
        }
    }
}

//! Context window management.
//!
//! When the next step would not fit, the oldest half of the evictable region
//! is dropped and everything after it slides down. The first `n_keep + 1`
//! tokens (BOS plus the pinned prompt prefix) are never touched.

use crate::backend::{Backend, BackendError, SeqId, StreamKind};
use crate::cache::SessionCache;
use crate::state::SessionState;
use tracing::{debug, warn};

/// Outcome of a successful swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapReport {
    pub n_left: i32,
    pub n_discard: i32,
    pub n_past_before: i32,
    pub n_past_after: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    n_ctx: i32,
    n_keep: i32,
}

impl ContextWindow {
    pub fn new(n_ctx: i32, n_keep: i32) -> Self {
        Self { n_ctx, n_keep }
    }

    pub fn n_ctx(&self) -> i32 {
        self.n_ctx
    }

    pub fn n_keep(&self) -> i32 {
        self.n_keep
    }

    /// Largest number of tokens evaluated in one step.
    pub fn max_step(&self) -> usize {
        (self.n_ctx - 4).max(0) as usize
    }

    /// Whether evaluating `n_embd` more tokens would overflow the window.
    /// A positive guidance offset counts against the window too.
    pub fn would_overflow(&self, n_past: i32, n_embd: usize, guidance_offset: i32) -> bool {
        n_past + n_embd as i32 + guidance_offset.max(0) > self.n_ctx
    }

    /// Evict half of the tokens after the pinned prefix.
    ///
    /// Only the main context's cache is rearranged. The guidance counter is
    /// rewound by the same amount when guidance is active. The session cache
    /// is invalidated because the backend cache no longer mirrors it.
    pub fn swap<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        state: &mut SessionState,
        cache: &mut SessionCache,
        guidance_active: bool,
    ) -> Result<SwapReport, BackendError> {
        let n_past = state.n_past();
        let n_left = n_past - self.n_keep - 1;
        let n_discard = n_left / 2;

        debug!(
            n_past,
            n_left,
            n_ctx = self.n_ctx,
            n_keep = self.n_keep,
            n_discard,
            "context full, swapping"
        );

        if n_discard > 0 {
            let keep_end = self.n_keep + 1;
            backend.cache_remove(
                StreamKind::Main,
                Some(SeqId::MAIN),
                keep_end,
                Some(keep_end + n_discard),
            )?;
            backend.cache_shift(
                StreamKind::Main,
                SeqId::MAIN,
                keep_end + n_discard,
                Some(n_past),
                -n_discard,
            )?;

            state.main.rewind(n_discard);
            if guidance_active {
                state.guidance.rewind(n_discard);
            }
        } else {
            warn!(n_past, n_keep = self.n_keep, "nothing to discard, window cannot make room");
        }

        cache.invalidate();

        Ok(SwapReport {
            n_left,
            n_discard: n_discard.max(0),
            n_past_before: n_past,
            n_past_after: state.n_past(),
        })
    }

    /// Swap until the next step fits or nothing more can be evicted.
    ///
    /// Returns the combined report of all swaps, or `None` when the step
    /// already fit. The step may still overflow afterwards when the pinned
    /// prefix leaves too little room; the caller has to shorten it.
    pub fn ensure_room<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        state: &mut SessionState,
        cache: &mut SessionCache,
        guidance_offset: Option<i32>,
    ) -> Result<Option<SwapReport>, BackendError> {
        let offset = guidance_offset.unwrap_or(0);
        let mut combined: Option<SwapReport> = None;
        while self.would_overflow(state.n_past(), state.embd.len(), offset) {
            let report = self.swap(backend, state, cache, guidance_offset.is_some())?;
            combined = Some(match combined {
                Some(prev) => SwapReport {
                    n_discard: prev.n_discard + report.n_discard,
                    n_past_after: report.n_past_after,
                    ..prev
                },
                None => report,
            });
            if report.n_discard == 0 {
                break;
            }
        }
        Ok(combined)
    }

    /// Tokens of room left for the next step.
    pub fn room(&self, n_past: i32, guidance_offset: i32) -> usize {
        (self.n_ctx - n_past - guidance_offset.max(0)).max(0) as usize
    }
}

//! Mutable per-session bookkeeping shared by the controller's components.

use crate::backend::{StreamKind, Token};
use crate::batch::DecodeStream;
use std::collections::VecDeque;

/// How many accepted tokens are remembered for stop detection.
const RECENT_CAPACITY: usize = 64;

/// Token queues, counters and turn flags for one session.
///
/// Fields are public; the window manager, cache and guidance code each
/// update the parts they own while the controller drives the turn.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Tokens waiting for the next decode step.
    pub embd: Vec<Token>,
    /// Every token queued for evaluation so far (prompt and user turns).
    pub embd_inp: Vec<Token>,
    /// Buffer fed to the guidance context during the current step.
    pub embd_guidance: Vec<Token>,
    /// Tokens mirrored to the session cache file.
    pub session_tokens: Vec<Token>,
    pub main: DecodeStream,
    pub guidance: DecodeStream,
    /// Prefix of `embd_inp` already moved into `embd`.
    pub n_consumed: usize,
    /// Prefix of `session_tokens` already confirmed to match the stream.
    pub n_session_consumed: usize,
    /// Samples left in the current turn.
    pub n_remain: i32,
    pub is_interacting: bool,
    pub is_antiprompt: bool,
    /// Whether tokens in `embd` are shown as they are produced.
    pub input_echo: bool,
    pub need_to_save_session: bool,
    /// Whether the guidance context holds logits for the current position.
    pub guidance_ready: bool,
    recent: VecDeque<Token>,
}

impl SessionState {
    pub fn new(n_predict: i32) -> Self {
        Self {
            embd: Vec::new(),
            embd_inp: Vec::new(),
            embd_guidance: Vec::new(),
            session_tokens: Vec::new(),
            main: DecodeStream::new(StreamKind::Main),
            guidance: DecodeStream::new(StreamKind::Guidance),
            n_consumed: 0,
            n_session_consumed: 0,
            n_remain: n_predict,
            is_interacting: false,
            is_antiprompt: false,
            input_echo: true,
            need_to_save_session: false,
            guidance_ready: false,
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
        }
    }

    pub fn n_past(&self) -> i32 {
        self.main.n_past()
    }

    pub fn n_past_guidance(&self) -> i32 {
        self.guidance.n_past()
    }

    /// All queued input has been moved into `embd`.
    pub fn queue_drained(&self) -> bool {
        self.embd_inp.len() <= self.n_consumed
    }

    /// Remember a token that was accepted by the sampler.
    pub fn record_accepted(&mut self, token: Token) {
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    /// The last `n` accepted tokens, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Token> {
        let skip = self.recent.len().saturating_sub(n);
        self.recent.iter().skip(skip).copied().collect()
    }

    pub fn last_accepted(&self) -> Option<Token> {
        self.recent.back().copied()
    }

    pub fn clear_recent(&mut self) {
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_window_is_bounded() {
        let mut state = SessionState::new(-1);
        for t in 0..100 {
            state.record_accepted(t);
        }
        assert_eq!(state.last_accepted(), Some(99));
        assert_eq!(state.recent(3), vec![97, 98, 99]);
        assert_eq!(state.recent(1000).len(), RECENT_CAPACITY);

        state.clear_recent();
        assert_eq!(state.last_accepted(), None);
    }

    #[test]
    fn queue_drains_as_input_is_consumed() {
        let mut state = SessionState::new(8);
        assert!(state.queue_drained());
        state.embd_inp = vec![1, 2, 3];
        assert!(!state.queue_drained());
        state.n_consumed = 3;
        assert!(state.queue_drained());
        assert_eq!(state.n_remain, 8);
    }
}

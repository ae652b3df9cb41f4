//! Inference backend trait and implementations.
//!
//! The backend trait is the cutpoint between the session controller and the
//! inference engine. Tokenization, the forward pass, sampling math and the
//! engine's KV cache all live behind `Backend`; the controller only decides
//! which tokens go where and at which positions.

pub mod llama_cpp;

#[cfg(test)]
pub(crate) mod scripted;

use thiserror::Error;

/// A token id from the backend's vocabulary.
pub type Token = i32;

/// Identifies a sequence inside one backend context's KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqId(pub i32);

impl SeqId {
    /// The only sequence the controller decodes into.
    pub const MAIN: SeqId = SeqId(0);
}

/// Which backend context a call targets.
///
/// The guidance context holds the negative-prompt stream used for
/// classifier-free guidance. It only exists when the backend was created
/// with a guidance scale above 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Main,
    Guidance,
}

/// Errors from inference backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    LoadError(String),

    #[error("tokenizer error: {0}")]
    TokenizerError(String),

    #[error("inference error: {0}")]
    InferenceError(String),

    #[error("kv cache error: {0}")]
    KvCache(String),

    #[error("state error: {0}")]
    State(String),

    #[error("no {0:?} context available")]
    MissingStream(StreamKind),
}

/// The backend contract consumed by the session controller.
///
/// Positions are `i32` to match the engine's position type. Range ends of
/// `None` mean "to the end of the cache".
pub trait Backend {
    /// Tokenize text. `add_bos` prepends the beginning-of-sequence token,
    /// `special` lets control-token text map to control tokens.
    fn tokenize(&self, text: &str, add_bos: bool, special: bool) -> Result<Vec<Token>, BackendError>;

    /// Decode `tokens` into `stream` starting at position `start`.
    ///
    /// Logits are produced for the last token only.
    fn decode(&mut self, stream: StreamKind, tokens: &[Token], start: i32) -> Result<(), BackendError>;

    /// Sample the next token from the main context's last logits, biased by
    /// the guidance context when `guided` is set.
    fn sample(&mut self, guided: bool) -> Result<Token, BackendError>;

    /// Register an accepted token with the repetition-penalty state. Grammar
    /// state only advances when `apply_grammar` is set.
    fn accept(&mut self, token: Token, apply_grammar: bool);

    /// Clear per-turn sampling state.
    fn reset_sampler(&mut self);

    /// Drop cache entries in `[from, to)`. `seq == None` targets every sequence.
    fn cache_remove(
        &mut self,
        stream: StreamKind,
        seq: Option<SeqId>,
        from: i32,
        to: Option<i32>,
    ) -> Result<(), BackendError>;

    /// Add `delta` to the positions of cache entries in `[from, to)`.
    fn cache_shift(
        &mut self,
        stream: StreamKind,
        seq: SeqId,
        from: i32,
        to: Option<i32>,
        delta: i32,
    ) -> Result<(), BackendError>;

    /// Render a token as text.
    fn token_to_text(&self, token: Token) -> String;

    /// Whether `token` ends generation.
    fn is_end_of_sequence(&self, token: Token) -> bool;

    /// The beginning-of-sequence token.
    fn bos_token(&self) -> Token;

    /// Whether prompts for this vocabulary get a BOS token.
    fn add_bos(&self) -> bool;

    /// Context window size of the main context.
    fn n_ctx(&self) -> u32;

    /// Context length the model was trained with.
    fn n_ctx_train(&self) -> u32;

    /// Whether a guidance context exists.
    fn has_guidance(&self) -> bool;

    /// Snapshot of the main context's internal state (KV cache, logits, rng).
    fn state_data(&self) -> Result<Vec<u8>, BackendError>;

    /// Restore a snapshot taken with `state_data`.
    fn restore_state(&mut self, data: &[u8]) -> Result<(), BackendError>;

    /// Reseed the sampler.
    fn set_seed(&mut self, seed: u32);
}

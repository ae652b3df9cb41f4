//! kvsession: interactive session controller for fixed-context language models.
//!
//! Keeps a conversation running inside a bounded context window. Handles
//! context swapping, prompt caching across runs, classifier-free guidance,
//! reverse-prompt detection and the turn protocol between user and model.
//! Inference itself sits behind the `Backend` trait.

pub mod backend;
pub mod batch;
pub mod cache;
pub mod config;
pub mod controller;
pub mod guidance;
pub mod input;
pub mod state;
pub mod stop;
pub mod window;

pub use backend::{Backend, BackendError, SeqId, StreamKind, Token};
pub use cache::{SessionCache, SessionIoError};
pub use config::{ContextConfig, ParameterError};
pub use controller::{ControllerError, StopReason, TurnController, TurnOutcome, TurnPhase};

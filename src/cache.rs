//! Session cache: persists evaluated tokens plus the backend state so a later
//! run with the same prompt can skip re-evaluating it.
//!
//! File layout (little endian):
//!
//! ```text
//! magic   [u8; 4]  "kvss"
//! version u32
//! n_tok   u32
//! tokens  [i32; n_tok]
//! n_state u64
//! state   [u8; n_state]
//! ```

use crate::backend::{Backend, BackendError, StreamKind, Token};
use crate::state::SessionState;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SESSION_MAGIC: [u8; 4] = *b"kvss";
pub const SESSION_VERSION: u32 = 1;

/// Failure reading or writing a session file.
///
/// Never fatal: the controller logs it and continues with caching disabled.
#[derive(Debug, Error)]
pub enum SessionIoError {
    #[error("failed to read session file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write session file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("session file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("session file {path} holds {n_tokens} tokens, more than the context capacity {capacity}")]
    TooLarge {
        path: PathBuf,
        n_tokens: usize,
        capacity: usize,
    },

    #[error("session file {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: BackendError,
    },
}

/// Read a session file, restore the backend state and return its tokens.
///
/// A missing file is a cold start and yields no tokens.
pub fn load<B: Backend + ?Sized>(
    backend: &mut B,
    path: &Path,
    capacity: usize,
) -> Result<Vec<Token>, SessionIoError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SessionIoError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let corrupt = |reason: &str| SessionIoError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut reader = Reader::new(&bytes);
    if reader.take(4).ok_or_else(|| corrupt("truncated header"))? != SESSION_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = reader.u32().ok_or_else(|| corrupt("truncated header"))?;
    if version != SESSION_VERSION {
        return Err(corrupt(&format!("unsupported version {}", version)));
    }

    let n_tokens = reader.u32().ok_or_else(|| corrupt("truncated header"))? as usize;
    if n_tokens > capacity {
        return Err(SessionIoError::TooLarge {
            path: path.to_path_buf(),
            n_tokens,
            capacity,
        });
    }
    let mut tokens = Vec::with_capacity(n_tokens);
    for _ in 0..n_tokens {
        tokens.push(reader.i32().ok_or_else(|| corrupt("truncated token list"))?);
    }

    let n_state = reader.u64().ok_or_else(|| corrupt("truncated state length"))? as usize;
    let state = reader.take(n_state).ok_or_else(|| corrupt("truncated state"))?;
    if !reader.is_empty() {
        return Err(corrupt("trailing bytes"));
    }

    backend
        .restore_state(state)
        .map_err(|source| SessionIoError::State {
            path: path.to_path_buf(),
            source,
        })?;

    debug!(path = %path.display(), n_tokens, n_state, "loaded session");
    Ok(tokens)
}

/// Write `tokens` and the backend's current state to `path`.
pub fn save<B: Backend + ?Sized>(
    backend: &B,
    path: &Path,
    tokens: &[Token],
) -> Result<(), SessionIoError> {
    let state = backend
        .state_data()
        .map_err(|source| SessionIoError::State {
            path: path.to_path_buf(),
            source,
        })?;

    let mut buf = Vec::with_capacity(4 + 4 + 4 + tokens.len() * 4 + 8 + state.len());
    buf.extend_from_slice(&SESSION_MAGIC);
    buf.extend_from_slice(&SESSION_VERSION.to_le_bytes());
    buf.extend_from_slice(&(tokens.len() as u32).to_le_bytes());
    for t in tokens {
        buf.extend_from_slice(&t.to_le_bytes());
    }
    buf.extend_from_slice(&(state.len() as u64).to_le_bytes());
    buf.extend_from_slice(&state);

    std::fs::write(path, &buf).map_err(|source| SessionIoError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), n_tokens = tokens.len(), "saved session");
    Ok(())
}

/// Length of the longest common prefix of two token sequences.
pub fn match_prefix(cached: &[Token], requested: &[Token]) -> usize {
    cached
        .iter()
        .zip(requested)
        .take_while(|(a, b)| a == b)
        .count()
}

/// How a loaded session relates to the requested prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Similarity {
    /// No prompt was given; the session file supplies it.
    FullPromptFromSession,
    /// The whole prompt is already cached.
    Exact,
    /// Less than half of the prompt matches.
    Low,
    Partial,
}

pub fn classify(matched: usize, requested_len: usize, prompt_empty: bool) -> Similarity {
    if prompt_empty && matched == requested_len {
        Similarity::FullPromptFromSession
    } else if matched >= requested_len {
        Similarity::Exact
    } else if matched < requested_len / 2 {
        Similarity::Low
    } else {
        Similarity::Partial
    }
}

/// Line a loaded session up with the prompt about to be evaluated.
///
/// Drops everything past the common prefix from the backend cache. When the
/// whole prompt matches but the session is longer, the session is cut so the
/// last prompt token is evaluated again and fresh logits exist for sampling.
pub fn align_with_prompt<B: Backend + ?Sized>(
    backend: &mut B,
    session_tokens: &mut Vec<Token>,
    prompt: &[Token],
    prompt_empty: bool,
) -> Result<usize, BackendError> {
    let matched = match_prefix(session_tokens, prompt);

    match classify(matched, prompt.len(), prompt_empty) {
        Similarity::FullPromptFromSession => info!("using full prompt from session file"),
        Similarity::Exact => info!("session file has exact match for prompt"),
        Similarity::Low => warn!(
            matched,
            n_prompt = prompt.len(),
            "session file has low similarity to prompt; will mostly be reevaluated"
        ),
        Similarity::Partial => info!(
            matched,
            n_prompt = prompt.len(),
            "session file matches prompt prefix"
        ),
    }

    backend.cache_remove(StreamKind::Main, None, matched as i32, None)?;

    if !prompt.is_empty() && matched == prompt.len() && session_tokens.len() > prompt.len() {
        debug!(
            n_session = session_tokens.len(),
            n_prompt = prompt.len(),
            "recalculate the cached logits"
        );
        session_tokens.truncate(prompt.len() - 1);
    }

    Ok(matched)
}

/// Skip tokens at the head of `embd` that the session cache already holds.
///
/// Each matching token is counted as resident in the main stream instead of
/// being decoded. On the first mismatch the cached tail is discarded.
pub fn reuse_prefix(state: &mut SessionState) {
    if state.n_session_consumed >= state.session_tokens.len() {
        return;
    }

    let mut i = 0;
    while i < state.embd.len() {
        if state.embd[i] != state.session_tokens[state.n_session_consumed] {
            state.session_tokens.truncate(state.n_session_consumed);
            break;
        }
        state.main.advance(1);
        state.n_session_consumed += 1;
        i += 1;
        if state.n_session_consumed >= state.session_tokens.len() {
            break;
        }
    }

    if i > 0 {
        state.embd.drain(..i);
    }
}

/// The session cache location and its write policy.
#[derive(Debug, Clone)]
pub struct SessionCache {
    path: Option<PathBuf>,
    read_only: bool,
}

impl SessionCache {
    pub fn new(path: Option<PathBuf>, read_only: bool) -> Self {
        Self { path, read_only }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.path.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.is_active() && !self.read_only
    }

    /// Stop using the cache for the rest of the session. The backend cache no
    /// longer mirrors the file once the window has been swapped.
    pub fn invalidate(&mut self) {
        if let Some(path) = self.path.take() {
            debug!(path = %path.display(), "session cache invalidated");
        }
    }

    /// Load the cached tokens, treating any failure as a cold start with the
    /// cache disabled.
    pub fn load_or_cold_start<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        capacity: usize,
    ) -> Vec<Token> {
        let Some(path) = self.path.clone() else {
            return Vec::new();
        };

        info!(path = %path.display(), "attempting to load saved session");
        if !path.exists() {
            info!("session file does not exist, will create");
            return Vec::new();
        }

        match load(backend, &path, capacity) {
            Ok(tokens) => {
                info!(n_tokens = tokens.len(), "loaded a session with prompt size");
                tokens
            }
            Err(e) => {
                warn!(error = %e, "session cache disabled");
                self.path = None;
                Vec::new()
            }
        }
    }

    /// Save if the cache is writable. A failed write disables the cache.
    pub fn save_or_disable<B: Backend + ?Sized>(&mut self, backend: &B, tokens: &[Token]) -> bool {
        if !self.is_writable() {
            return false;
        }
        let Some(path) = self.path.clone() else {
            return false;
        };
        match save(backend, &path, tokens) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "session cache disabled");
                self.path = None;
                false
            }
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Some(head)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4)
            .and_then(|b| b.try_into().ok())
            .map(i32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

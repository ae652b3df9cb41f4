//! Deterministic backend for unit tests.
//!
//! Text maps to one token per character (offset by `CHAR_BASE`), exact
//! strings can be overridden with fixed token lists, samples come from a
//! script, and the KV cache is a position -> token map per stream so that
//! removals and shifts can be asserted on.

use super::{Backend, BackendError, SeqId, StreamKind, Token};
use std::collections::{BTreeMap, HashMap, VecDeque};

pub const BOS: Token = 999;
pub const EOS: Token = 1000;
pub const CHAR_BASE: Token = 0x1_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeCall {
    pub stream: StreamKind,
    pub tokens: Vec<Token>,
    pub start: i32,
}

pub struct ScriptedBackend {
    pub n_ctx: u32,
    pub guidance: bool,
    pub add_bos: bool,
    pub overrides: HashMap<String, Vec<Token>>,
    pub script: VecDeque<Token>,
    pub decode_calls: Vec<DecodeCall>,
    pub sample_calls: Vec<bool>,
    pub accepted: Vec<(Token, bool)>,
    pub sampler_resets: usize,
    pub seed: Option<u32>,
    /// Per-stream outcome of upcoming decode calls; `true` fails the call.
    pub failures: HashMap<StreamKind, VecDeque<bool>>,
    pub kv: HashMap<StreamKind, BTreeMap<i32, Token>>,
}

impl ScriptedBackend {
    pub fn new(n_ctx: u32) -> Self {
        Self {
            n_ctx,
            guidance: false,
            add_bos: false,
            overrides: HashMap::new(),
            script: VecDeque::new(),
            decode_calls: Vec::new(),
            sample_calls: Vec::new(),
            accepted: Vec::new(),
            sampler_resets: 0,
            seed: None,
            failures: HashMap::new(),
            kv: HashMap::new(),
        }
    }

    pub fn with_guidance(mut self) -> Self {
        self.guidance = true;
        self
    }

    pub fn with_tokens(mut self, text: &str, tokens: &[Token]) -> Self {
        self.overrides.insert(text.to_string(), tokens.to_vec());
        self
    }

    pub fn with_script(mut self, tokens: &[Token]) -> Self {
        self.script.extend(tokens.iter().copied());
        self
    }

    /// Queue the character tokens of `text` as samples.
    pub fn with_text_script(mut self, text: &str) -> Self {
        self.script.extend(text.chars().map(char_token));
        self
    }

    pub fn fail_decodes(&mut self, stream: StreamKind, n: usize) {
        self.failures.entry(stream).or_default().extend(std::iter::repeat(true).take(n));
    }

    /// Let `ok` decode calls through, then fail one.
    pub fn fail_decode_after(&mut self, stream: StreamKind, ok: usize) {
        let schedule = self.failures.entry(stream).or_default();
        schedule.extend(std::iter::repeat(false).take(ok));
        schedule.push_back(true);
    }

    /// Cache contents of `stream` ordered by position.
    pub fn cells(&self, stream: StreamKind) -> Vec<(i32, Token)> {
        self.kv
            .get(&stream)
            .map(|m| m.iter().map(|(&p, &t)| (p, t)).collect())
            .unwrap_or_default()
    }

    pub fn decoded(&self, stream: StreamKind) -> Vec<Token> {
        self.decode_calls
            .iter()
            .filter(|c| c.stream == stream)
            .flat_map(|c| c.tokens.iter().copied())
            .collect()
    }
}

pub fn char_token(c: char) -> Token {
    CHAR_BASE + c as Token
}

pub fn text_tokens(text: &str) -> Vec<Token> {
    text.chars().map(char_token).collect()
}

impl Backend for ScriptedBackend {
    fn tokenize(&self, text: &str, add_bos: bool, _special: bool) -> Result<Vec<Token>, BackendError> {
        let mut out = Vec::new();
        if add_bos {
            out.push(BOS);
        }
        match self.overrides.get(text) {
            Some(tokens) => out.extend_from_slice(tokens),
            None => out.extend(text_tokens(text)),
        }
        Ok(out)
    }

    fn decode(&mut self, stream: StreamKind, tokens: &[Token], start: i32) -> Result<(), BackendError> {
        if stream == StreamKind::Guidance && !self.guidance {
            return Err(BackendError::MissingStream(stream));
        }
        let fail = self
            .failures
            .get_mut(&stream)
            .and_then(|s| s.pop_front())
            .unwrap_or(false);
        if fail {
            return Err(BackendError::InferenceError("scripted failure".into()));
        }
        self.decode_calls.push(DecodeCall {
            stream,
            tokens: tokens.to_vec(),
            start,
        });
        let cells = self.kv.entry(stream).or_default();
        for (i, &t) in tokens.iter().enumerate() {
            cells.insert(start + i as i32, t);
        }
        Ok(())
    }

    fn sample(&mut self, guided: bool) -> Result<Token, BackendError> {
        self.sample_calls.push(guided);
        Ok(self.script.pop_front().unwrap_or(EOS))
    }

    fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.accepted.push((token, apply_grammar));
    }

    fn reset_sampler(&mut self) {
        self.sampler_resets += 1;
    }

    fn cache_remove(
        &mut self,
        stream: StreamKind,
        _seq: Option<SeqId>,
        from: i32,
        to: Option<i32>,
    ) -> Result<(), BackendError> {
        let cells = self.kv.entry(stream).or_default();
        let end = to.unwrap_or(i32::MAX);
        cells.retain(|&p, _| p < from || p >= end);
        Ok(())
    }

    fn cache_shift(
        &mut self,
        stream: StreamKind,
        _seq: SeqId,
        from: i32,
        to: Option<i32>,
        delta: i32,
    ) -> Result<(), BackendError> {
        let cells = self.kv.entry(stream).or_default();
        let end = to.unwrap_or(i32::MAX);
        let moved: Vec<(i32, Token)> = cells
            .iter()
            .filter(|&(&p, _)| p >= from && p < end)
            .map(|(&p, &t)| (p, t))
            .collect();
        for (p, _) in &moved {
            cells.remove(p);
        }
        for (p, t) in moved {
            cells.insert(p + delta, t);
        }
        Ok(())
    }

    fn token_to_text(&self, token: Token) -> String {
        if token >= CHAR_BASE {
            char::from_u32((token - CHAR_BASE) as u32)
                .map(String::from)
                .unwrap_or_default()
        } else if token == BOS || token == EOS {
            String::new()
        } else {
            format!("<{}>", token)
        }
    }

    fn is_end_of_sequence(&self, token: Token) -> bool {
        token == EOS
    }

    fn bos_token(&self) -> Token {
        BOS
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_ctx_train(&self) -> u32 {
        4096
    }

    fn has_guidance(&self) -> bool {
        self.guidance
    }

    fn state_data(&self) -> Result<Vec<u8>, BackendError> {
        let mut out = Vec::new();
        for (p, t) in self.cells(StreamKind::Main) {
            out.extend_from_slice(&p.to_le_bytes());
            out.extend_from_slice(&t.to_le_bytes());
        }
        Ok(out)
    }

    fn restore_state(&mut self, data: &[u8]) -> Result<(), BackendError> {
        if data.len() % 8 != 0 {
            return Err(BackendError::State("truncated state".into()));
        }
        let cells = self.kv.entry(StreamKind::Main).or_default();
        cells.clear();
        for pair in data.chunks_exact(8) {
            let p = i32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let t = i32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
            cells.insert(p, t);
        }
        Ok(())
    }

    fn set_seed(&mut self, seed: u32) {
        self.seed = Some(seed);
    }
}

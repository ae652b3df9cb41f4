//! Turn controller: the high-level API for an interactive session.
//!
//! Wires a backend to the window manager, session cache, guidance stream and
//! stop detection. Call `answer()` to run the model until it hands control
//! back, `query()` to queue the user's reply, or `run()` to do both against a
//! reader and writer until input ends.
//!
//! ```ignore
//! let config = ContextConfig::from_arg_string(r#"-i -r "User:" -p "Transcript of a dialog.""#)?;
//! let mut controller = TurnController::new(backend, config)?;
//!
//! let mut out = std::io::stdout();
//! controller.answer(&mut out)?;
//! controller.query("What is the capital of France?\n", &mut out)?;
//! controller.answer(&mut out)?;
//! ```

use crate::backend::{Backend, BackendError, Token};
use crate::batch::DecodeError;
use crate::cache::{self, SessionCache};
use crate::config::{ContextConfig, ParameterError};
use crate::guidance::GuidanceStream;
use crate::input;
use crate::state::SessionState;
use crate::stop::{self, StopDecision, StopMode, N_PREV};
use crate::window::ContextWindow;
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const INSTRUCT_PREFIX: &str = "\n\n### Instruction:\n\n";
const INSTRUCT_SUFFIX: &str = "\n\n### Response:\n\n";

/// Errors that end a turn.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("decode failed {consecutive} times in a row: {source}")]
    DecodeFailed {
        consecutive: u32,
        #[source]
        source: DecodeError,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to write transcript: {0}")]
    Transcript(#[from] serde_json::Error),
}

/// Where the controller is within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Queued input is being moved into the decode buffer.
    ProcessingQueue,
    Sampling,
    /// Pending tokens are being echoed.
    Displaying,
    /// Control is with the user.
    AwaitingUser,
    /// The session is over.
    Terminated,
}

/// Why `answer()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Antiprompt,
    EndOfSequence,
    BudgetExhausted,
    /// `n_predict == -2` and the window is full.
    ContextFull,
    /// The controller was already waiting for input.
    UserTurn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnOutcome {
    pub phase: TurnPhase,
    pub reason: StopReason,
}

/// Token-level record of the session.
///
/// Tokens echoed as part of multi-token steps (prompts, user input) are
/// input; single sampled tokens and the formatted user turns are output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    pub input_tokens: Vec<Token>,
    pub output_tokens: Vec<Token>,
    pub output_text: String,
}

impl Transcript {
    pub fn write_json(&self, path: &Path) -> Result<(), ControllerError> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(io::BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Drives one interactive session over a backend.
pub struct TurnController<B: Backend> {
    backend: B,
    config: ContextConfig,
    window: ContextWindow,
    cache: SessionCache,
    guidance: Option<GuidanceStream>,
    state: SessionState,
    inp_pfx: Vec<Token>,
    inp_sfx: Vec<Token>,
    n_matching_session_tokens: usize,
    transcript: Transcript,
    phase: TurnPhase,
    decode_failures: u32,
    finished: bool,
}

impl<B: Backend> TurnController<B> {
    /// Resolve the configuration, load the session cache and queue the prompt.
    pub fn new(mut backend: B, config: ContextConfig) -> Result<Self, ControllerError> {
        let config = config.resolve()?;
        let n_ctx = backend.n_ctx() as i32;
        let n_ctx_train = backend.n_ctx_train();
        if n_ctx_train > 0 && n_ctx as u32 > n_ctx_train {
            warn!(
                n_ctx_train,
                n_ctx, "model was trained on only {} context tokens", n_ctx_train
            );
        }

        let mut cache = SessionCache::new(config.prompt_cache.clone(), config.prompt_cache_ro);
        let mut session_tokens = cache.load_or_cold_start(&mut backend, n_ctx.max(0) as usize);

        if let Some(seed) = config.seed {
            backend.set_seed(seed);
        }

        let add_bos = backend.add_bos();
        let mut embd_inp = if config.interactive_first
            || config.instruct
            || !config.prompt.is_empty()
            || session_tokens.is_empty()
        {
            backend.tokenize(&config.prompt, add_bos, true)?
        } else {
            session_tokens.clone()
        };
        if embd_inp.is_empty() {
            embd_inp.push(backend.bos_token());
        }

        let max = (n_ctx - 4).max(0) as usize;
        if embd_inp.len() > max {
            return Err(ParameterError::PromptTooLong {
                n_tokens: embd_inp.len(),
                max,
            }
            .into());
        }

        let n_keep = match config.n_keep {
            Some(k) if k >= 0 && (k as usize) <= embd_inp.len() && !config.instruct => k,
            _ => embd_inp.len() as i32,
        };

        let guidance = if config.cfg_scale > 1.0 {
            if backend.has_guidance() {
                Some(GuidanceStream::from_prompts(
                    &backend,
                    &config.cfg_negative_prompt,
                    &config.prompt,
                    add_bos,
                )?)
            } else {
                warn!("guidance scale set but backend has no guidance context, sampling unguided");
                None
            }
        } else {
            None
        };

        let n_matching_session_tokens = if session_tokens.is_empty() {
            0
        } else {
            cache::align_with_prompt(
                &mut backend,
                &mut session_tokens,
                &embd_inp,
                config.prompt.is_empty(),
            )?
        };

        let inp_pfx = backend.tokenize(INSTRUCT_PREFIX, add_bos, true)?;
        let inp_sfx = backend.tokenize(INSTRUCT_SUFFIX, false, true)?;

        debug!(n_prompt = embd_inp.len(), n_keep, "prompt");
        if config.interactive {
            for antiprompt in &config.antiprompt {
                info!(%antiprompt, "reverse prompt");
            }
            if config.input_prefix_bos {
                info!("input prefix with BOS");
            }
            if !config.input_prefix.is_empty() {
                info!(prefix = %config.input_prefix, "input prefix");
            }
            if !config.input_suffix.is_empty() {
                info!(suffix = %config.input_suffix, "input suffix");
            }
        }
        info!(
            n_ctx,
            n_batch = config.n_batch,
            n_predict = config.n_predict,
            n_keep,
            "generate"
        );

        let mut state = SessionState::new(config.n_predict);
        state.embd_inp = embd_inp;
        state.session_tokens = session_tokens;

        let mut controller = Self {
            backend,
            window: ContextWindow::new(n_ctx, n_keep),
            cache,
            guidance,
            state,
            inp_pfx,
            inp_sfx,
            n_matching_session_tokens,
            transcript: Transcript::default(),
            phase: TurnPhase::ProcessingQueue,
            decode_failures: 0,
            finished: false,
            config,
        };
        controller.reset();
        Ok(controller)
    }

    /// Reinitialize turn state. The prompt stays queued and the backend and
    /// session cache are left as they are.
    pub fn reset(&mut self) {
        let state = &mut self.state;
        state.is_antiprompt = false;
        state.input_echo = true;
        state.need_to_save_session =
            self.cache.is_active() && self.n_matching_session_tokens < state.embd_inp.len();
        state.main.reset();
        state.guidance.reset();
        state.n_remain = self.config.n_predict;
        state.n_consumed = 0;
        state.n_session_consumed = 0;
        state.embd.clear();
        state.embd_guidance.clear();
        state.guidance_ready = false;
        state.is_interacting = self.config.interactive_first;
        self.transcript = Transcript::default();
        self.decode_failures = 0;
        self.phase = TurnPhase::ProcessingQueue;
    }

    /// Run the model until it hands control back or the session ends.
    pub fn answer<W: Write>(&mut self, out: &mut W) -> Result<TurnOutcome, ControllerError> {
        let mut reason = StopReason::UserTurn;

        loop {
            if !self.state.embd.is_empty() {
                if let Some(stop) = self.evaluate_pending(out)? {
                    return Ok(self.finish_turn(TurnPhase::Terminated, stop));
                }
            }

            self.state.embd.clear();
            self.state.embd_guidance.clear();

            if self.state.queue_drained() && !self.state.is_interacting {
                self.phase = TurnPhase::Sampling;
                if self.config.finite_budget() && self.state.n_remain <= 0 {
                    debug!("sampling budget already spent");
                } else {
                    self.sample_next()?;
                }
            } else {
                self.phase = TurnPhase::ProcessingQueue;
                self.drain_queue();
            }

            if self.state.input_echo {
                self.phase = TurnPhase::Displaying;
                self.display(out)?;
            }

            if self.config.finite_budget() && self.state.n_remain <= 0 {
                self.state.n_remain = self.config.n_predict;
                self.state.is_interacting = true;
                reason = StopReason::BudgetExhausted;
                if !self.config.interactive {
                    return Ok(self.finish_turn(TurnPhase::Terminated, reason));
                }
            }

            if self.state.queue_drained() {
                let decision = self.check_stop(out)?;
                if decision.terminate {
                    info!("end of text");
                    return Ok(self.finish_turn(TurnPhase::Terminated, StopReason::EndOfSequence));
                }
                if decision.end_of_sequence {
                    reason = StopReason::EndOfSequence;
                } else if decision.is_interacting {
                    reason = StopReason::Antiprompt;
                }
            }

            if self.state.is_interacting {
                break;
            }
        }

        Ok(self.finish_turn(TurnPhase::AwaitingUser, reason))
    }

    /// Queue a user turn. A buffer of length one or less only hands control
    /// back to the model.
    pub fn query<W: Write>(&mut self, buffer: &str, out: &mut W) -> Result<(), ControllerError> {
        if self.config.instruct {
            write!(out, "\n> ")?;
        }

        if self.config.input_prefix_bos {
            debug!("adding input prefix BOS token");
            let bos = self.backend.bos_token();
            self.state.embd_inp.push(bos);
        }

        if !self.config.input_prefix.is_empty() {
            write!(out, "{}", self.config.input_prefix)?;
        }

        if buffer.len() > 1 {
            self.push_user_input(buffer, out)?;
        } else {
            debug!("empty line, passing control back");
        }

        self.state.input_echo = false;
        self.backend.reset_sampler();
        self.state.clear_recent();
        self.state.is_interacting = false;
        self.phase = TurnPhase::ProcessingQueue;
        out.flush()?;
        Ok(())
    }

    /// Alternate `answer()` and `query()` until the session terminates or
    /// `input` ends.
    pub fn run<R: BufRead, W: Write>(&mut self, input: &mut R, out: &mut W) -> Result<(), ControllerError> {
        loop {
            let outcome = self.answer(out)?;
            if outcome.phase == TurnPhase::Terminated {
                return Ok(());
            }
            match input::read_user_input(input, self.config.multiline_input)? {
                Some(buffer) => self.query(&buffer, out)?,
                None => {
                    info!("end of input");
                    return Ok(());
                }
            }
        }
    }

    /// Save the session cache and transcript if configured. Runs once; also
    /// called on drop.
    pub fn shutdown(&mut self) -> Result<(), ControllerError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if self.config.prompt_cache_all && self.cache.is_writable() {
            info!(n_tokens = self.state.session_tokens.len(), "saving final output to session file");
            self.cache
                .save_or_disable(&self.backend, &self.state.session_tokens);
        }
        if let Some(path) = &self.config.transcript {
            self.transcript.write_json(path)?;
        }
        Ok(())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn n_keep(&self) -> i32 {
        self.window.n_keep()
    }

    pub fn n_ctx(&self) -> i32 {
        self.window.n_ctx()
    }

    pub fn guidance(&self) -> Option<&GuidanceStream> {
        self.guidance.as_ref()
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    fn finish_turn(&mut self, phase: TurnPhase, reason: StopReason) -> TurnOutcome {
        self.phase = phase;
        debug!(?phase, ?reason, n_past = self.state.n_past(), "turn finished");
        TurnOutcome { phase, reason }
    }

    /// Evaluate `embd`: truncate, make room, reuse cached prefix, feed the
    /// guidance and main contexts. Returns a stop reason when the session
    /// cannot continue.
    fn evaluate_pending<W: Write>(&mut self, out: &mut W) -> Result<Option<StopReason>, ControllerError> {
        let max_step = self.window.max_step();
        self.truncate_pending(max_step, out)?;

        let guidance_offset = self.guidance.as_ref().map(GuidanceStream::offset);
        if self.config.n_predict == -2
            && self.window.would_overflow(
                self.state.n_past(),
                self.state.embd.len(),
                guidance_offset.unwrap_or(0),
            )
        {
            info!("context full and n_predict == -2, stopping");
            return Ok(Some(StopReason::ContextFull));
        }

        self.window.ensure_room(
            &mut self.backend,
            &mut self.state,
            &mut self.cache,
            guidance_offset,
        )?;

        let room = self
            .window
            .room(self.state.n_past(), guidance_offset.unwrap_or(0));
        if room == 0 {
            warn!(
                n_past = self.state.n_past(),
                n_keep = self.window.n_keep(),
                "no room left after swapping"
            );
            return Ok(Some(StopReason::ContextFull));
        }
        self.truncate_pending(room, out)?;

        cache::reuse_prefix(&mut self.state);

        if let Some(guidance) = &self.guidance {
            if let Err(e) = guidance.step(&mut self.backend, &mut self.state, self.config.n_batch) {
                warn!(error = %e, "guidance evaluation failed, next sample is unguided");
            }
        }

        let committed = match self
            .state
            .main
            .feed(&mut self.backend, &self.state.embd, self.config.n_batch)
        {
            Ok(()) => {
                self.decode_failures = 0;
                self.state.embd.len()
            }
            Err(e) => {
                self.decode_failures += 1;
                error!(error = %e, consecutive = self.decode_failures, "failed to eval");
                let committed = e.evaluated;
                if self.config.max_decode_failures > 0
                    && self.decode_failures >= self.config.max_decode_failures
                {
                    self.mirror_to_session(committed);
                    self.state.embd.clear();
                    self.state.embd_guidance.clear();
                    self.state.guidance_ready = false;
                    return Err(ControllerError::DecodeFailed {
                        consecutive: self.decode_failures,
                        source: e,
                    });
                }
                committed
            }
        };

        self.mirror_to_session(committed);
        Ok(None)
    }

    /// Drop pending tokens beyond `max`, telling the user how many.
    fn truncate_pending<W: Write>(&mut self, max: usize, out: &mut W) -> io::Result<()> {
        if self.state.embd.len() <= max {
            return Ok(());
        }
        let skipped = self.state.embd.len() - max;
        self.state.embd.truncate(max);
        warn!(skipped, "input too long");
        write!(
            out,
            "<<input too long: skipped {} token{}>>",
            skipped,
            if skipped != 1 { "s" } else { "" }
        )?;
        out.flush()
    }

    fn mirror_to_session(&mut self, committed: usize) {
        if committed > 0 && self.cache.is_active() {
            let state = &mut self.state;
            state.session_tokens.extend_from_slice(&state.embd[..committed]);
            state.n_session_consumed = state.session_tokens.len();
        }
    }

    fn sample_next(&mut self) -> Result<(), ControllerError> {
        if self.state.need_to_save_session && self.cache.is_writable() {
            self.state.need_to_save_session = false;
            self.cache
                .save_or_disable(&self.backend, &self.state.session_tokens);
            debug!(n_tokens = self.state.session_tokens.len(), "saved session to cache");
        }

        let guided = self.guidance.is_some() && self.state.guidance_ready;
        let id = self.backend.sample(guided)?;
        self.backend.accept(id, true);
        self.state.record_accepted(id);

        debug!(token = id, guided, n_remain = self.state.n_remain, "sampled");

        self.state.embd.push(id);
        self.state.input_echo = true;
        self.state.n_remain -= 1;
        Ok(())
    }

    fn drain_queue(&mut self) {
        let state = &mut self.state;
        debug!(
            n_inp = state.embd_inp.len(),
            n_consumed = state.n_consumed,
            "processing queued input"
        );
        while state.embd_inp.len() > state.n_consumed {
            let token = state.embd_inp[state.n_consumed];
            state.embd.push(token);
            self.backend.accept(token, false);
            state.record_accepted(token);
            state.n_consumed += 1;
            if state.embd.len() >= self.config.n_batch {
                break;
            }
        }
    }

    fn display<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        let multi = self.state.embd.len() > 1;
        for &id in &self.state.embd {
            let piece = self.backend.token_to_text(id);
            out.write_all(piece.as_bytes())?;
            if multi {
                self.transcript.input_tokens.push(id);
            } else {
                self.transcript.output_tokens.push(id);
                self.transcript.output_text.push_str(&piece);
            }
        }
        out.flush()
    }

    fn check_stop<W: Write>(&mut self, out: &mut W) -> Result<StopDecision, ControllerError> {
        let antiprompt_hit = if self.config.antiprompt.is_empty() {
            false
        } else {
            let last_output = stop::render_recent(&self.backend, &self.state.recent(N_PREV));
            match stop::find_antiprompt(&last_output, &self.config.antiprompt, self.config.interactive) {
                Some(antiprompt) => {
                    debug!(%antiprompt, "found antiprompt");
                    true
                }
                None => false,
            }
        };

        let end_of_sequence = self
            .state
            .last_accepted()
            .is_some_and(|t| self.backend.is_end_of_sequence(t));

        let decision = stop::decide(
            antiprompt_hit,
            end_of_sequence,
            StopMode {
                interactive: self.config.interactive,
                instruct: self.config.instruct,
                has_antiprompts: !self.config.antiprompt.is_empty(),
            },
        );

        if decision.inject_antiprompt {
            if let Some(first) = self.config.antiprompt.first() {
                let tokens = self.backend.tokenize(first, false, true)?;
                self.state.embd_inp.extend_from_slice(&tokens);
            }
        }
        if decision.end_of_sequence && decision.is_interacting {
            debug!("found EOS token");
            writeln!(out)?;
        }

        self.state.is_antiprompt = decision.is_antiprompt;
        if decision.is_interacting {
            self.state.is_interacting = true;
        }
        Ok(decision)
    }

    fn push_user_input<W: Write>(&mut self, buffer: &str, out: &mut W) -> Result<(), ControllerError> {
        if !self.config.input_suffix.is_empty() {
            write!(out, "{}", self.config.input_suffix)?;
        }

        let original_size = self.state.embd_inp.len();

        if self.config.instruct && !self.state.is_antiprompt {
            self.state.n_consumed = self.state.embd_inp.len();
            self.state.embd_inp.extend_from_slice(&self.inp_pfx);
        }

        let text = if self.config.escape {
            input::process_escapes(buffer)
        } else {
            buffer.to_string()
        };

        let line_pfx = self.backend.tokenize(&self.config.input_prefix, false, true)?;
        let line_inp = self.backend.tokenize(&text, false, false)?;
        let line_sfx = self.backend.tokenize(&self.config.input_suffix, false, true)?;

        self.state.embd_inp.extend_from_slice(&line_pfx);
        self.state.embd_inp.extend_from_slice(&line_inp);
        self.state.embd_inp.extend_from_slice(&line_sfx);

        if self.config.instruct {
            self.state.embd_inp.extend_from_slice(&self.inp_sfx);
        }

        for &token in &self.state.embd_inp[original_size..] {
            self.transcript.output_tokens.push(token);
            self.transcript
                .output_text
                .push_str(&self.backend.token_to_text(token));
        }

        self.state.n_remain -= line_inp.len() as i32;
        debug!(n_tokens = line_inp.len(), n_remain = self.state.n_remain, "queued user input");
        Ok(())
    }
}

impl<B: Backend> Drop for TurnController<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "shutdown failed");
        }
    }
}

//! llama.cpp backend: GGUF model loading and inference via llama-cpp-2.
//!
//! Holds the main context and, when guidance is enabled, a second context on
//! the same model for the negative prompt. llama.cpp owns the KV caches; this
//! backend only translates positions, ranges and sampling calls.

#[cfg(feature = "llama-cpp")]
mod inner {
    use crate::backend::{Backend, BackendError, SeqId, StreamKind, Token};
    use crate::config::ContextConfig;

    use clap::Args;
    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::context::LlamaContext;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::{AddBos, LlamaModel, VocabType};
    use llama_cpp_2::sampling::LlamaSampler;
    use llama_cpp_2::token::data::LlamaTokenData;
    use llama_cpp_2::token::data_array::LlamaTokenDataArray;
    use llama_cpp_2::token::LlamaToken;
    use serde::{Deserialize, Serialize};

    use std::num::NonZeroU32;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info};

    /// Model and sampler settings for the llama.cpp backend.
    #[derive(Debug, Clone, Serialize, Deserialize, Args)]
    #[serde(default)]
    pub struct LlamaCppConfig {
        /// Path to the GGUF model.
        #[arg(short = 'm', long)]
        pub model: PathBuf,

        /// Layers to offload to the GPU.
        #[arg(long = "n-gpu-layers", default_value_t = 0)]
        pub n_gpu_layers: u32,

        #[arg(long = "temp", default_value_t = 0.8)]
        pub temperature: f32,

        #[arg(long, default_value_t = 40)]
        pub top_k: i32,

        #[arg(long, default_value_t = 0.95)]
        pub top_p: f32,

        #[arg(long, default_value_t = 1.1)]
        pub repeat_penalty: f32,

        /// Tokens considered by the repetition penalty.
        #[arg(long, default_value_t = 64)]
        pub repeat_last_n: i32,
    }

    impl Default for LlamaCppConfig {
        fn default() -> Self {
            Self {
                model: PathBuf::new(),
                n_gpu_layers: 0,
                temperature: 0.8,
                top_k: 40,
                top_p: 0.95,
                repeat_penalty: 1.1,
                repeat_last_n: 64,
            }
        }
    }

    /// llama.cpp backend wrapping the llama-cpp-2 crate.
    ///
    /// Field ordering matters: both contexts drop before the model, the model
    /// before the backend.
    pub struct LlamaCppBackend {
        // Contexts borrow from model and must be declared before it.
        ctx: LlamaContext<'static>,
        ctx_guidance: Option<LlamaContext<'static>>,
        model: Box<LlamaModel>,
        _backend: Box<LlamaBackend>,
        sampler: LlamaSampler,
        sampler_config: LlamaCppConfig,
        cfg_scale: f32,
        seed: u32,
        /// Batch index of the last logits in each context, if any.
        main_logits: Option<i32>,
        guidance_logits: Option<i32>,
        /// Token already registered with the sampler chain by `sample`.
        pre_accepted: Option<Token>,
    }

    impl LlamaCppBackend {
        /// Load a GGUF model and create the contexts the session needs.
        pub fn load(config: &LlamaCppConfig, session: &ContextConfig) -> Result<Self, BackendError> {
            let path: &Path = &config.model;
            if !path.exists() {
                return Err(BackendError::LoadError(format!(
                    "GGUF file not found: {}",
                    path.display()
                )));
            }

            let backend = Box::new(
                LlamaBackend::init()
                    .map_err(|e| BackendError::LoadError(format!("backend init: {}", e)))?,
            );

            let model_params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
            let model = Box::new(
                LlamaModel::load_from_file(&backend, path, &model_params)
                    .map_err(|e| BackendError::LoadError(format!("{}", e)))?,
            );

            let n_batch = session.n_batch.max(1) as u32;
            let ctx_params = || {
                LlamaContextParams::default()
                    .with_n_ctx(NonZeroU32::new(session.n_ctx))
                    .with_n_batch(n_batch)
                    .with_n_seq_max(1)
            };

            // SAFETY: the model is boxed (stable address) and stored in the
            // same struct; both contexts are declared before it and drop first.
            let model_ref: &'static LlamaModel = unsafe { &*(&*model as *const LlamaModel) };

            let ctx = model_ref
                .new_context(&backend, ctx_params())
                .map_err(|e| BackendError::LoadError(format!("context: {}", e)))?;

            let ctx_guidance = if session.cfg_scale > 1.0 {
                Some(
                    model_ref
                        .new_context(&backend, ctx_params())
                        .map_err(|e| BackendError::LoadError(format!("guidance context: {}", e)))?,
                )
            } else {
                None
            };

            let seed = session.seed.unwrap_or(0);
            let sampler = make_sampler(config, seed);

            info!(
                model = %path.display(),
                n_ctx = ctx.n_ctx(),
                n_ctx_train = model.n_ctx_train(),
                guidance = ctx_guidance.is_some(),
                "loaded model"
            );

            Ok(Self {
                ctx,
                ctx_guidance,
                model,
                _backend: backend,
                sampler,
                sampler_config: config.clone(),
                cfg_scale: session.cfg_scale,
                seed,
                main_logits: None,
                guidance_logits: None,
                pre_accepted: None,
            })
        }

        fn context_mut(&mut self, stream: StreamKind) -> Result<&mut LlamaContext<'static>, BackendError> {
            match stream {
                StreamKind::Main => Ok(&mut self.ctx),
                StreamKind::Guidance => self
                    .ctx_guidance
                    .as_mut()
                    .ok_or(BackendError::MissingStream(stream)),
            }
        }

        fn sample_guided(&mut self) -> Option<Result<Token, BackendError>> {
            let main_idx = self.main_logits?;
            let guidance_idx = self.guidance_logits?;
            let ctx_guidance = self.ctx_guidance.as_ref()?;

            let combined = combine_guidance(
                self.ctx.get_logits_ith(main_idx),
                ctx_guidance.get_logits_ith(guidance_idx),
                self.cfg_scale,
            );
            let mut candidates = LlamaTokenDataArray::from_iter(
                combined
                    .into_iter()
                    .enumerate()
                    .map(|(i, logit)| LlamaTokenData::new(LlamaToken(i as i32), logit, 0.0)),
                false,
            );
            candidates.apply_sampler(&self.sampler);
            Some(
                candidates
                    .selected_token()
                    .map(|t| t.0)
                    .ok_or_else(|| BackendError::InferenceError("sampler selected no token".into())),
            )
        }
    }

    fn make_sampler(config: &LlamaCppConfig, seed: u32) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::penalties(config.repeat_last_n, config.repeat_penalty, 0.0, 0.0),
            LlamaSampler::top_k(config.top_k),
            LlamaSampler::top_p(config.top_p, 1),
            LlamaSampler::temp(config.temperature),
            LlamaSampler::dist(seed),
        ])
    }

    fn log_softmax(logits: &[f32]) -> Vec<f32> {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();
        logits.iter().map(|&l| l - max - log_sum).collect()
    }

    /// Classifier-free guidance on log-probabilities:
    /// `guidance + scale * (main - guidance)`.
    pub(crate) fn combine_guidance(main: &[f32], guidance: &[f32], scale: f32) -> Vec<f32> {
        let main = log_softmax(main);
        let guidance = log_softmax(guidance);
        main.iter()
            .zip(&guidance)
            .map(|(&m, &g)| g + scale * (m - g))
            .collect()
    }

    fn position(p: i32) -> Result<u32, BackendError> {
        u32::try_from(p).map_err(|_| BackendError::KvCache(format!("negative position {}", p)))
    }

    impl Backend for LlamaCppBackend {
        // str_to_token always parses special tokens, so `special` has no effect here.
        fn tokenize(&self, text: &str, add_bos: bool, _special: bool) -> Result<Vec<Token>, BackendError> {
            let bos = if add_bos { AddBos::Always } else { AddBos::Never };
            let tokens = self
                .model
                .str_to_token(text, bos)
                .map_err(|e| BackendError::TokenizerError(format!("{}", e)))?;
            Ok(tokens.iter().map(|t| t.0).collect())
        }

        fn decode(&mut self, stream: StreamKind, tokens: &[Token], start: i32) -> Result<(), BackendError> {
            if tokens.is_empty() {
                return Ok(());
            }
            let n_tokens = tokens.len();
            let mut batch = LlamaBatch::new(n_tokens, 1);
            for (i, &tok) in tokens.iter().enumerate() {
                batch
                    .add(LlamaToken(tok), start + i as i32, &[SeqId::MAIN.0], i == n_tokens - 1)
                    .map_err(|e| BackendError::InferenceError(format!("batch add: {}", e)))?;
            }

            let ctx = self.context_mut(stream)?;
            ctx.decode(&mut batch)
                .map_err(|e| BackendError::InferenceError(format!("decode: {}", e)))?;

            let last = Some((n_tokens - 1) as i32);
            match stream {
                StreamKind::Main => self.main_logits = last,
                StreamKind::Guidance => self.guidance_logits = last,
            }
            Ok(())
        }

        fn sample(&mut self, guided: bool) -> Result<Token, BackendError> {
            if guided {
                if let Some(result) = self.sample_guided() {
                    return result;
                }
                debug!("guidance logits unavailable, sampling unguided");
            }
            // llama.cpp registers the token with the chain while sampling.
            let token = self.sampler.sample(&self.ctx, self.main_logits.unwrap_or(-1)).0;
            self.pre_accepted = Some(token);
            Ok(token)
        }

        fn accept(&mut self, token: Token, _apply_grammar: bool) {
            if self.pre_accepted.take() == Some(token) {
                return;
            }
            self.sampler.accept(LlamaToken(token));
        }

        fn reset_sampler(&mut self) {
            self.pre_accepted = None;
            self.sampler.reset();
        }

        fn cache_remove(
            &mut self,
            stream: StreamKind,
            seq: Option<SeqId>,
            from: i32,
            to: Option<i32>,
        ) -> Result<(), BackendError> {
            let src = seq.map(|s| position(s.0)).transpose()?;
            let p0 = Some(position(from)?);
            let p1 = to.map(position).transpose()?;
            self.context_mut(stream)?
                .clear_kv_cache_seq(src, p0, p1)
                .map_err(|e| BackendError::KvCache(format!("{}", e)))?;
            Ok(())
        }

        fn cache_shift(
            &mut self,
            stream: StreamKind,
            seq: SeqId,
            from: i32,
            to: Option<i32>,
            delta: i32,
        ) -> Result<(), BackendError> {
            let p0 = Some(position(from)?);
            let p1 = to.map(position).transpose()?;
            self.context_mut(stream)?
                .kv_cache_seq_add(seq.0, p0, p1, delta)
                .map_err(|e| BackendError::KvCache(format!("{}", e)))
        }

        fn token_to_text(&self, token: Token) -> String {
            self.model
                .token_to_piece_bytes(LlamaToken(token), 128, false, None)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default()
        }

        fn is_end_of_sequence(&self, token: Token) -> bool {
            self.model.is_eog_token(LlamaToken(token))
        }

        fn bos_token(&self) -> Token {
            self.model.token_bos().0
        }

        fn add_bos(&self) -> bool {
            self.model.vocab_type() == VocabType::SPM
        }

        fn n_ctx(&self) -> u32 {
            self.ctx.n_ctx()
        }

        fn n_ctx_train(&self) -> u32 {
            self.model.n_ctx_train()
        }

        fn has_guidance(&self) -> bool {
            self.ctx_guidance.is_some()
        }

        fn state_data(&self) -> Result<Vec<u8>, BackendError> {
            let mut buf = vec![0u8; self.ctx.get_state_size()];
            // SAFETY: buf holds get_state_size() bytes.
            let written = unsafe { self.ctx.copy_state_data(buf.as_mut_ptr()) };
            buf.truncate(written);
            Ok(buf)
        }

        fn restore_state(&mut self, data: &[u8]) -> Result<(), BackendError> {
            // SAFETY: llama.cpp validates the blob against the context.
            let read = unsafe { self.ctx.set_state_data(data) };
            if read != data.len() {
                return Err(BackendError::State(format!(
                    "read {} of {} state bytes",
                    read,
                    data.len()
                )));
            }
            self.main_logits = None;
            Ok(())
        }

        fn set_seed(&mut self, seed: u32) {
            if seed != self.seed {
                self.seed = seed;
                self.sampler = make_sampler(&self.sampler_config, seed);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn guidance_at_scale_one_keeps_main_distribution() {
            let main = [1.0, 2.0, 3.0];
            let combined = combine_guidance(&main, &[3.0, 0.0, 0.0], 1.0);
            let expected = log_softmax(&main);
            for (c, e) in combined.iter().zip(&expected) {
                assert!((c - e).abs() < 1e-5);
            }
        }

        #[test]
        fn guidance_pushes_away_from_negative_prompt() {
            let combined = combine_guidance(&[1.0, 1.0], &[2.0, 0.0], 2.0);
            assert!(combined[1] > combined[0]);
        }
    }
}

#[cfg(feature = "llama-cpp")]
pub use inner::{LlamaCppBackend, LlamaCppConfig};

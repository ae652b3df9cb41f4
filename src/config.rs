//! Session parameters.
//!
//! `ContextConfig` is filled from the command line, from a JSON file, or from
//! a single argument string handed over by a host application. It is resolved
//! once at startup; everything after that treats it as read-only.

use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// Reverse prompt added in instruct mode.
pub const INSTRUCT_ANTIPROMPT: &str = "### Instruction:\n\n";

/// Smallest context the controller will run with.
pub const MIN_N_CTX: u32 = 8;

/// Invalid startup parameters. Always fatal, never raised mid-session.
#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("could not parse the input parameters: {0}")]
    Arguments(#[from] clap::Error),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("batch size must be at least 1")]
    ZeroBatch,

    #[error("guidance scale must be finite and at least 1 (got {0})")]
    GuidanceScale(f32),

    #[error("prompt is too long ({n_tokens} tokens, max {max})")]
    PromptTooLong { n_tokens: usize, max: usize },
}

/// Per-session parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Args)]
#[serde(default)]
pub struct ContextConfig {
    /// Context window size in tokens (0 = model default).
    #[arg(short = 'c', long = "ctx-size", default_value_t = 512)]
    pub n_ctx: u32,

    /// Tokens of the initial prompt to keep when the context is swapped
    /// (unset or negative = whole prompt).
    #[arg(long = "keep", allow_negative_numbers = true)]
    pub n_keep: Option<i32>,

    /// Maximum tokens per decode call.
    #[arg(short = 'b', long = "batch-size", default_value_t = 512)]
    pub n_batch: usize,

    /// Tokens to predict per turn (-1 = infinite, -2 = until context is full).
    #[arg(short = 'n', long = "n-predict", default_value_t = -1, allow_negative_numbers = true)]
    pub n_predict: i32,

    /// Initial prompt.
    #[arg(short = 'p', long, default_value = "")]
    pub prompt: String,

    /// Halt generation at this string and return control (repeatable).
    #[arg(short = 'r', long = "reverse-prompt")]
    pub antiprompt: Vec<String>,

    /// Run in interactive mode.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Wait for user input before generating.
    #[arg(long)]
    pub interactive_first: bool,

    /// Instruction mode: wrap user input with instruction/response markers.
    #[arg(long, visible_alias = "ins")]
    pub instruct: bool,

    /// Keep collecting lines until a line ends with '\'.
    #[arg(long = "multiline-input")]
    pub multiline_input: bool,

    /// Process escape sequences in user input.
    #[arg(short = 'e', long)]
    pub escape: bool,

    /// Prefix a BOS token to every user input.
    #[arg(long = "in-prefix-bos")]
    pub input_prefix_bos: bool,

    /// Text inserted before every user input.
    #[arg(long = "in-prefix", default_value = "")]
    pub input_prefix: String,

    /// Text inserted after every user input.
    #[arg(long = "in-suffix", default_value = "")]
    pub input_suffix: String,

    /// File used to cache the evaluated prompt between runs.
    #[arg(long)]
    pub prompt_cache: Option<PathBuf>,

    /// Also save user input and generations to the prompt cache on exit.
    #[arg(long)]
    pub prompt_cache_all: bool,

    /// Use the prompt cache without updating it.
    #[arg(long)]
    pub prompt_cache_ro: bool,

    /// Negative prompt for classifier-free guidance.
    #[arg(long, default_value = "")]
    pub cfg_negative_prompt: String,

    /// Guidance strength (1.0 = disabled).
    #[arg(long, default_value_t = 1.0)]
    pub cfg_scale: f32,

    /// RNG seed (unset = time based).
    #[arg(short = 's', long)]
    pub seed: Option<u32>,

    /// Consecutive decode failures after which a turn aborts (0 = never).
    #[arg(long, default_value_t = 4)]
    pub max_decode_failures: u32,

    /// Write a JSON transcript of the session here on exit.
    #[arg(long)]
    pub transcript: Option<PathBuf>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_keep: None,
            n_batch: 512,
            n_predict: -1,
            prompt: String::new(),
            antiprompt: Vec::new(),
            interactive: false,
            interactive_first: false,
            instruct: false,
            multiline_input: false,
            escape: false,
            input_prefix_bos: false,
            input_prefix: String::new(),
            input_suffix: String::new(),
            prompt_cache: None,
            prompt_cache_all: false,
            prompt_cache_ro: false,
            cfg_negative_prompt: String::new(),
            cfg_scale: 1.0,
            seed: None,
            max_decode_failures: 4,
            transcript: None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "kvsession")]
struct ArgString {
    #[command(flatten)]
    config: ContextConfig,
}

impl ContextConfig {
    /// Parse a host-supplied argument string such as
    /// `-i -c 4096 --keep 256 --prompt "You are a helpful assistant." -r "User:"`.
    pub fn from_arg_string(params: &str) -> Result<Self, ParameterError> {
        let args = std::iter::once("kvsession".to_string()).chain(split_arguments(params));
        Ok(ArgString::try_parse_from(args)?.config)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ParameterError> {
        let content = std::fs::read_to_string(path).map_err(|source| ParameterError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ParameterError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply startup rules and reject invalid combinations.
    pub fn resolve(mut self) -> Result<Self, ParameterError> {
        if self.n_batch == 0 {
            return Err(ParameterError::ZeroBatch);
        }
        if !self.cfg_scale.is_finite() || self.cfg_scale < 1.0 {
            return Err(ParameterError::GuidanceScale(self.cfg_scale));
        }

        if self.n_ctx != 0 && self.n_ctx < MIN_N_CTX {
            warn!(requested = self.n_ctx, "minimum context size is {}, using minimum size", MIN_N_CTX);
            self.n_ctx = MIN_N_CTX;
        }

        if self.seed.is_none() {
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            self.seed = Some(seed);
        }

        if self.instruct {
            self.interactive_first = true;
            if !self.antiprompt.iter().any(|a| a == INSTRUCT_ANTIPROMPT) {
                self.antiprompt.push(INSTRUCT_ANTIPROMPT.to_string());
            }
        }
        if self.interactive_first {
            self.interactive = true;
        }

        Ok(self)
    }

    /// Whether the sampling budget is finite (neither -1 nor -2).
    pub fn finite_budget(&self) -> bool {
        self.n_predict >= 0
    }
}

/// Split on spaces, keeping double-quoted segments as single arguments.
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    for (i, segment) in input.split('"').enumerate() {
        if i % 2 == 1 {
            if !segment.is_empty() {
                arguments.push(segment.to_string());
            }
        } else {
            arguments.extend(
                segment
                    .split(' ')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_quoted_segments() {
        let args = split_arguments(r#"-i -c 4096 --prompt "Hello there, friend." -r "User:""#);
        assert_eq!(
            args,
            vec!["-i", "-c", "4096", "--prompt", "Hello there, friend.", "-r", "User:"]
        );
    }

    #[test]
    fn arg_string_parses_session_flags() {
        let config = ContextConfig::from_arg_string(
            r#"-i -c 4096 --keep 256 -n -2 --prompt "Transcript of a dialog" -r "User:" -r "Bob:" -s 1234"#,
        )
        .unwrap();
        assert!(config.interactive);
        assert_eq!(config.n_ctx, 4096);
        assert_eq!(config.n_keep, Some(256));
        assert_eq!(config.n_predict, -2);
        assert_eq!(config.prompt, "Transcript of a dialog");
        assert_eq!(config.antiprompt, vec!["User:", "Bob:"]);
        assert_eq!(config.seed, Some(1234));
        assert_eq!(config.n_batch, 512);
    }

    #[test]
    fn unknown_argument_is_a_parameter_error() {
        let err = ContextConfig::from_arg_string("--definitely-not-a-flag").unwrap_err();
        assert!(matches!(err, ParameterError::Arguments(_)));
    }

    #[test]
    fn resolve_applies_startup_rules() {
        let config = ContextConfig {
            n_ctx: 4,
            instruct: true,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.n_ctx, MIN_N_CTX);
        assert!(config.interactive_first);
        assert!(config.interactive);
        assert_eq!(config.antiprompt, vec![INSTRUCT_ANTIPROMPT]);
        assert!(config.seed.is_some());
    }

    #[test]
    fn resolving_twice_changes_nothing() {
        let once = ContextConfig {
            n_ctx: 4,
            instruct: true,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let twice = once.clone().resolve().unwrap();
        assert_eq!(twice.n_ctx, MIN_N_CTX);
        assert_eq!(twice.seed, once.seed);
        assert_eq!(twice.antiprompt, once.antiprompt);
        assert_eq!(twice.interactive, once.interactive);
    }

    #[test]
    fn resolve_rejects_bad_values() {
        let err = ContextConfig {
            n_batch: 0,
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ParameterError::ZeroBatch));

        let err = ContextConfig {
            cfg_scale: 0.5,
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ParameterError::GuidanceScale(_)));
    }

    #[test]
    fn json_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{ "n_ctx": 2048, "antiprompt": ["User:"], "interactive": true }"#).unwrap();

        let config = ContextConfig::from_json_file(&path).unwrap();
        assert_eq!(config.n_ctx, 2048);
        assert_eq!(config.antiprompt, vec!["User:"]);
        assert!(config.interactive);
        assert_eq!(config.n_batch, 512);
        assert_eq!(config.n_predict, -1);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ContextConfig::from_json_file(&path).unwrap_err(),
            ParameterError::Json { .. }
        ));
    }
}

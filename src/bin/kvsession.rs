//! Interactive session over a GGUF model.
//!
//! ```text
//! kvsession -m model.gguf -i -r "User:" -p "Transcript of a dialog between User and Bob."
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`). Logs go to stderr so
//! stdout carries only the conversation.

#[cfg(feature = "llama-cpp")]
mod cli {
    use clap::Parser;
    use kvsession::backend::llama_cpp::{LlamaCppBackend, LlamaCppConfig};
    use kvsession::{ContextConfig, TurnController};
    use std::path::PathBuf;

    #[derive(Debug, Parser)]
    #[command(name = "kvsession", version, about = "Interactive session over a GGUF model")]
    pub struct Cli {
        #[command(flatten)]
        pub model: LlamaCppConfig,

        #[command(flatten)]
        pub session: ContextConfig,

        /// Read session parameters from a JSON file instead of the flags.
        #[arg(long)]
        pub config: Option<PathBuf>,
    }

    pub fn run() -> Result<(), Box<dyn std::error::Error>> {
        let cli = Cli::parse();
        let session = match &cli.config {
            Some(path) => ContextConfig::from_json_file(path)?,
            None => cli.session,
        }
        .resolve()?;

        let backend = LlamaCppBackend::load(&cli.model, &session)?;
        let mut controller = TurnController::new(backend, session)?;

        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        controller.run(&mut stdin.lock(), &mut stdout.lock())?;
        controller.shutdown()?;
        Ok(())
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "llama-cpp")]
fn main() {
    init_tracing();
    if let Err(e) = cli::run() {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "llama-cpp"))]
fn main() {
    init_tracing();
    eprintln!("kvsession requires the 'llama-cpp' feature.");
    eprintln!("Run with: cargo run --features llama-cpp -- -m <model.gguf> -i");
    std::process::exit(1);
}

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokrelay_core::{
    Relay, StreamState,
    client::{ClientStreamReader, FragmentSink, Transport},
    config::Config,
    model::GenerationRequest,
    server,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "tokrelay: stream LLM output over SSE", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// JSON or TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Listen address, overrides `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Stream one prompt from a running relay (prints fragments live, Ctrl-C stops)
    Chat {
        #[arg(long, default_value = "http://127.0.0.1:8787/api/stream")]
        url: String,
        #[arg(short, long, help = "Prompt text")]
        prompt: String,
        #[arg(long, default_value = "")]
        model: String,
        /// Use the EventSource-style GET transport
        #[arg(long)]
        get: bool,
    },
}

struct StdoutSink;

impl FragmentSink for StdoutSink {
    fn on_fragment(&mut self, text: &str) {
        print!("{text}");
        io::stdout().flush().ok();
    }

    fn on_state(&mut self, state: &StreamState) {
        tracing::debug!(%state, "stream state");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind } => {
            let mut cfg = match config {
                Some(path) => Config::from_path(&path)?,
                None => Config::default(),
            };
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            let relay = Arc::new(Relay::from_config(&cfg)?);
            let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
            server::serve(listener, relay, async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
            })
            .await?;
        }
        Commands::Chat {
            url,
            prompt,
            model,
            get,
        } => {
            let transport = if get { Transport::Get } else { Transport::Post };
            let reader = ClientStreamReader::new(url)?.with_transport(transport);
            let handle = reader.start(GenerationRequest::new(prompt, model), StdoutSink);

            let token = handle.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let state = handle.join().await;
            println!();
            if let StreamState::Failed(reason) = state {
                anyhow::bail!("stream failed: {reason}");
            }
        }
    }

    Ok(())
}

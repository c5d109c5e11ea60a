//! Bunny CLI - manage local models and chat with them.

use bunny_client::ControlPlaneClient;
use bunny_coordinator::{Coordinator, CoordinatorConfig, CoordinatorConfigBuilder};
use clap::{Parser, Subcommand};

mod commands;

/// Bunny - local model inference from the terminal
#[derive(Parser)]
#[command(name = "bunny")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Control-plane API base URL (default: $BUNNY_API_URL or http://127.0.0.1:8080/api)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Port the inference server listens on
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Context size for the inference server
    #[arg(long, global = true)]
    ctx_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed and available models
    Models,

    /// Show the inference server status
    Status,

    /// Start the inference server with a model
    Start {
        /// Model name
        model: String,
    },

    /// Stop the inference server
    Stop,

    /// Download a model (Ctrl-C cancels)
    Pull {
        /// Model name
        model: String,
    },

    /// Show active downloads
    Downloads {
        /// Retry a failed or cancelled job by id
        #[arg(long)]
        retry: Option<String>,
    },

    /// Ask a single question and print the reply
    Ask {
        /// Model to answer with
        #[arg(short, long)]
        model: String,
        /// Maximum tokens in the reply
        #[arg(long)]
        max_tokens: Option<u32>,
        /// The prompt
        #[arg(required = true)]
        prompt: Vec<String>,
    },

    /// Interactive chat (/regen regenerates, /quit exits, Ctrl-C cancels)
    Chat {
        /// Model to chat with
        #[arg(short, long)]
        model: String,
        /// System prompt (empty disables it)
        #[arg(long)]
        system: Option<String>,
    },
}

impl Cli {
    fn config(&self) -> CoordinatorConfig {
        let mut builder = CoordinatorConfigBuilder::from_config(CoordinatorConfig::from_env());
        if let Some(url) = &self.api_url {
            builder = builder.api_url(url.clone());
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(ctx_size) = self.ctx_size {
            builder = builder.ctx_size(ctx_size);
        }
        match &self.command {
            Commands::Ask {
                max_tokens: Some(tokens),
                ..
            } => builder = builder.max_tokens(*tokens),
            Commands::Chat {
                system: Some(prompt),
                ..
            } => builder = builder.system_prompt(prompt.clone()),
            _ => {}
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = cli.config();
    let client = ControlPlaneClient::with_url(config.api_url.as_str());
    let coordinator = Coordinator::new(client, config);

    match cli.command {
        Commands::Models => commands::models::run(&coordinator).await,
        Commands::Status => commands::server::status(&coordinator).await,
        Commands::Start { model } => commands::server::start(&coordinator, &model).await,
        Commands::Stop => commands::server::stop(&coordinator).await,
        Commands::Pull { model } => commands::pull::run(&coordinator, &model).await,
        Commands::Downloads { retry } => {
            commands::downloads::run(&coordinator, retry.as_deref()).await
        }
        Commands::Ask { model, prompt, .. } => {
            commands::ask::run(&coordinator, &model, &prompt.join(" ")).await
        }
        Commands::Chat { model, .. } => commands::chat::run(&coordinator, &model).await,
    }
}

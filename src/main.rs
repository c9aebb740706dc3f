//! Critic CLI
//!
//! Commands:
//!   serve    - Start the conversation server
//!   sessions - List stored sessions
//!   show     - Print one session's subject and history
//!   reset    - Clear a session
//!   config   - Show (or write) the configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use critic::{
    AppState, Config, ContextStore, ConversationHandler, LLMProvider, OpenAICompatibleProvider,
    PromptBuilder, StreamingRelay,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SESSION_DB: &str = "sessions.db";

#[derive(Parser)]
#[command(name = "critic")]
#[command(about = "Code review chat relay over a hosted LLM")]
#[command(version)]
struct Cli {
    /// Data directory for the session database [default: ~/.critic/data]
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the conversation server
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Keep sessions in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// List stored sessions
    Sessions,

    /// Print one session's subject and history
    Show {
        /// Session ID
        session: String,
    },

    /// Clear a session's subject and history
    Reset {
        /// Session ID
        session: String,
    },

    /// Show the configuration
    Config {
        /// Write the default configuration if none exists
        #[arg(long)]
        init: bool,
    },
}

fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return path.replacen("~", &home, 1);
        }
    }
    path.to_string()
}

fn open_store(data_dir: &Path, config: &Config) -> Result<ContextStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
    ContextStore::open(&data_dir.join(SESSION_DB), config.session.history_cap)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let data_dir = match &cli.data_dir {
        Some(dir) => PathBuf::from(expand_path(dir)),
        None => critic::config::data_dir()?,
    };
    let config = Config::load_or_default()?;

    match cli.command {
        None => {
            let store = open_store(&data_dir, &config)?;
            let sessions = store.list()?;
            println!("Model:      {}", config.model.model);
            println!("Endpoint:   {}", config.model.base_url);
            println!("API key:    ${}", config.model.api_key_env);
            println!("Data dir:   {}", data_dir.display());
            println!("Sessions:   {}", sessions.len());
            println!("\nRun 'critic serve' to start the server.");
        }

        Some(Commands::Serve { port, ephemeral }) => {
            let store = if ephemeral {
                ContextStore::in_memory(config.session.history_cap)
            } else {
                open_store(&data_dir, &config)?
            };

            let provider = OpenAICompatibleProvider::from_env(
                &config.model.base_url,
                &config.model.api_key_env,
                &config.model.model,
            )?;
            let meta = provider.metadata();
            tracing::info!(model = %meta.id, endpoint = %meta.endpoint, ephemeral, "starting critic");

            let relay = StreamingRelay::new(Arc::new(provider), config.model.generation_params());
            let handler = ConversationHandler::new(
                Arc::new(store),
                PromptBuilder::from_config(&config.session),
                relay,
            );
            let state = Arc::new(AppState::new(handler));

            critic::server::serve(state, port.unwrap_or(config.server.port)).await?;
        }

        Some(Commands::Sessions) => {
            let store = open_store(&data_dir, &config)?;
            let sessions = store.list()?;
            if sessions.is_empty() {
                println!("No sessions yet.");
            }
            for s in sessions {
                println!(
                    "{:<36}  {:<8}  {:>2} entries  {}",
                    s.id,
                    if s.has_subject { "code" } else { "empty" },
                    s.history_len,
                    s.updated_at.unwrap_or_default()
                );
            }
        }

        Some(Commands::Show { session }) => {
            let store = open_store(&data_dir, &config)?;
            let snapshot = store.get(&session).await?;
            match &snapshot.subject {
                Some(subject) => println!("Subject:\n{}\n", subject),
                None => println!("Subject: (none)\n"),
            }
            for message in &snapshot.history {
                println!("[{}]\n{}\n", message.role.as_str(), message.content);
            }
        }

        Some(Commands::Reset { session }) => {
            let store = open_store(&data_dir, &config)?;
            store.reset(&session).await?;
            println!("Session '{}' cleared.", session);
        }

        Some(Commands::Config { init }) => {
            let path = Config::path()?;
            if init && Config::load()?.is_none() {
                Config::default().save()?;
                println!("Wrote default config to {}", path.display());
            }
            println!("# {}", path.display());
            println!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        }
    }

    Ok(())
}

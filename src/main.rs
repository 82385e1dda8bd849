// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use runa_acp::{serve_stdio, Adapter, ChannelNotifier, McpDispatcherFactory};
use runa_config::Config;
use runa_model::OpenAiCompatProvider;
use runa_skills::SkillRegistry;
use runa_store::Store;

// Exit codes (sysexits-style where one fits).
const EXIT_CONFIG: i32 = 64;
const EXIT_STORAGE: i32 = 65;
const EXIT_PROVIDER: i32 = 69;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // The stdio transport owns stdout; tracing must stay on stderr, which
    // init_logging guarantees.  TLS needs a process-wide crypto provider
    // before the first reqwest connection.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = match runa_config::load_config(cli.config.as_deref()) {
        Ok(mut c) => {
            if let Some(path) = &cli.storage {
                c.storage.path = path.clone();
            }
            c
        }
        Err(e) => {
            eprintln!("runa: configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        }
        Commands::Sessions { status } => {
            let store = open_store_or_exit(&config);
            let filter = match status.as_deref() {
                None => None,
                Some(s) => match s.parse() {
                    Ok(parsed) => Some(parsed),
                    Err(_) => {
                        eprintln!("runa: unknown status '{s}' (active | completed | cancelled)");
                        std::process::exit(EXIT_CONFIG);
                    }
                },
            };
            match store.list_sessions(filter) {
                Ok(sessions) => {
                    for s in sessions {
                        println!(
                            "{}  {:<9}  {}  {}",
                            s.session_id,
                            s.status.as_str(),
                            s.updated_at.to_rfc3339(),
                            s.workspace_path
                        );
                    }
                }
                Err(e) => {
                    eprintln!("runa: {e}");
                    std::process::exit(EXIT_STORAGE);
                }
            }
        }
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: Config) {
    // A hosted endpoint without credentials cannot serve a single prompt;
    // fail fast instead of erroring on the first session.
    if config.provider.resolve_api_key().is_none() && !is_local_endpoint(&config.provider.base_url)
    {
        eprintln!(
            "runa: provider unavailable: no API key for {} (set {} or provider.api_key)",
            config.provider.base_url,
            config.provider.api_key_env.as_deref().unwrap_or("provider.api_key_env")
        );
        std::process::exit(EXIT_PROVIDER);
    }

    let store = Arc::new(open_store_or_exit(&config));
    let provider = Arc::new(OpenAiCompatProvider::from_config(&config.provider));
    let skills = Arc::new(SkillRegistry::discover(
        &config.skills.global_dirs,
        &config.skills.project_dirs,
    ));
    tracing::info!(skills = skills.list_metadata().len(), "skill discovery complete");

    // The engine runs on Send tasks; the !Send protocol connection drains
    // its session updates through this channel.
    let (update_tx, update_rx) = tokio::sync::mpsc::channel(256);
    let notifier = Arc::new(ChannelNotifier::new(update_tx));

    let adapter = match Adapter::new(
        store,
        provider,
        skills,
        Arc::new(McpDispatcherFactory),
        notifier,
        &config,
    ) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            eprintln!("runa: configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tokio::select! {
        result = serve_stdio(adapter, update_rx) => {
            if let Err(e) = result {
                eprintln!("runa: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            std::process::exit(EXIT_INTERRUPTED);
        }
    }
}

fn open_store_or_exit(config: &Config) -> Store {
    match Store::open(&config.storage.path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("runa: storage unavailable: {e}");
            std::process::exit(EXIT_STORAGE);
        }
    }
}

fn is_local_endpoint(base_url: &str) -> bool {
    base_url.contains("localhost") || base_url.contains("127.0.0.1") || base_url.contains("0.0.0.0")
}

fn init_logging(verbose: bool) {
    // Default filter: warnings everywhere, info for our own crates.
    let default_filter = if verbose { "info,runa=debug" } else { "warn,runa=info" };
    let filter = EnvFilter::try_from_env("RUNA_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

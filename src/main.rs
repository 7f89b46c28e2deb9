use chatrelay::constants::API_TOKEN_ENV;
use chatrelay::logging::{init_tracing, setup_panic_hook};
use chatrelay::*;

use clap::Parser;
use std::sync::Arc;

async fn serve(args: ServeArgs) {
    let api_token = match std::env::var(API_TOKEN_ENV) {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: {} environment variable is missing or empty.", API_TOKEN_ENV);
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", args.host, args.port);
    let state = match AppState::new(args, api_token) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Relaying chat={} image={} vision={}",
        state.args.chat_model,
        state.args.image_model,
        state.args.vision_model
    );

    let app = build_router(state);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("chatrelay listening on {}", addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // The chat client owns the terminal, so its logs only go to the file.
    let _guard = match &cli.command {
        Command::Serve(_) => init_tracing("chatrelay.log", "chatrelay=info", true),
        Command::Chat(_) => init_tracing("chatrelay-chat.log", "chatrelay=info", false),
    };
    setup_panic_hook();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => {
            if let Err(e) = repl::run(args).await {
                tracing::error!("Chat client failed: {}", e);
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

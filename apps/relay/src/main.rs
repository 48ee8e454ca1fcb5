use anyhow::Context;
use clap::Parser;
use televisit_relay::{app, auth::TokenVerifier, cli::Cli, config::Config, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let verifier = TokenVerifier::new(
        config.token_secret.as_bytes(),
        config.token_issuer.as_deref(),
    );
    let state = AppState::new(verifier);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("televisit relay listening on {addr}");

    axum::serve(listener, app(state))
        .await
        .context("server error")?;
    Ok(())
}

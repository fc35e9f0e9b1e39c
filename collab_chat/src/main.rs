use anyhow::Result;
use clap::Parser;
use collab_chat::{api, auth::TokenVerifier, config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(user) = cli.issue_token.as_deref() {
        let user = chat_protocol::UserId::parse(user)?;
        let token = TokenVerifier::new(cfg.jwt_secret.as_bytes())
            .issue(&user, time::Duration::hours(24))?;
        println!("{token}");
        return Ok(());
    }

    tracing::info!(bind = %cfg.bind, db = %cfg.database_path.display(), "starting collab_chat");
    api::run_http_server(cfg).await
}

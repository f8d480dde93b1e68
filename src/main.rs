use clap::Parser;
use colored::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use duel_arena::cli::{self, Args};
use duel_arena::realtime::ChangeFeed;
use duel_arena::store::{DataService, SqliteService};
use duel_arena::web::{self, AppState};

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = args.resolve_config()?;
    init_tracing(&config.log_level);

    let feed = ChangeFeed::new(config.channel_capacity);
    let service: Arc<dyn DataService> = Arc::new(SqliteService::open(&config.database, feed)?);

    if let Some(path) = &args.seed {
        let n = cli::seed(service.as_ref(), path)?;
        eprintln!("{}", format!("  Seeded {} streams from {}", n, path.display()).bright_green());
    }

    if args.web {
        let state = AppState {
            service,
            config: Arc::new(config),
        };
        web::serve(state).await?;
        return Ok(());
    }

    if let Some(route) = args.duel_route() {
        cli::run_duel(service, &config, route?, &args).await?;
        return Ok(());
    }

    if args.lobby || !args.picks.is_empty() || args.seed.is_none() {
        cli::run_lobby(service.as_ref(), &args.picks)?;
    }
    Ok(())
}

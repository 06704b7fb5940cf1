use std::net::SocketAddr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loft_core::MIGRATOR;
use loft_core::scan::{Scheduler, WatchService};
use loft_server::config::Config;
use loft_server::routes::create_router;
use loft_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loft_server=debug,loft_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    config.ensure_directories()?;

    let options: SqliteConnectOptions = config.database_url.parse()?;
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options.create_if_missing(true))
        .await?;
    MIGRATOR.run(&pool).await?;
    info!("database ready at {}", config.database_url);

    let state = AppState::new(&config, pool.clone()).await?;

    // Jobs left running by a previous process are unowned now.
    state.engine.reconcile_interrupted().await?;

    tokio::spawn(
        Scheduler::new(pool.clone(), state.engine.clone(), config.scheduler_tick).run(),
    );
    tokio::spawn(
        WatchService::new(pool, state.engine.clone(), state.provider.clone()).run(),
    );

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

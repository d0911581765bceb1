//! BuildFleet server

use buildfleet_api::{AppState, routes};
use buildfleet_config::{SystemConfig, load_system_config};
use buildfleet_core::artifact::MemoryArtifactStore;
use buildfleet_core::cloud::DisabledProvisioner;
use buildfleet_core::event::BroadcastNotifier;
use buildfleet_core::secret::MemorySecretStore;
use buildfleet_db::{MemoryStore, PgStore, Store, create_pool, run_migrations};
use buildfleet_scheduler::{Collaborators, FleetService, HttpWorkerControl};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "buildfleet-server", about = "CI build scheduler and worker fleet manager")]
struct Args {
    /// Path to buildfleet.kdl
    #[arg(long, env = "BUILDFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "BUILDFLEET_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            load_system_config(path)?
        }
        None => SystemConfig::default(),
    };

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("No database configured, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let events = Arc::new(BroadcastNotifier::default());
    let collab = Collaborators {
        store: store.clone(),
        control: Arc::new(HttpWorkerControl::new(config.scheduler.dispatch_timeout)),
        cloud: Arc::new(DisabledProvisioner),
        artifacts: Arc::new(MemoryArtifactStore::new()),
        secrets: Arc::new(MemorySecretStore::new()),
        notifier: events.clone(),
    };

    let service = FleetService::new(collab, &config);
    service.bootstrap().await?;
    let tasks = service.spawn();

    let state = AppState::new(store, &service, events);
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, public_url = %config.public_url, "Starting server");
    axum::serve(listener, app).await?;

    for task in tasks {
        task.abort();
    }
    Ok(())
}

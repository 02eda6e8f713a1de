use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use sandbox_agent::config::AppConfig;
use sandbox_agent::recall::InMemoryRecall;
use sandbox_agent::server::{router, AppState};
use sandbox_agent::store::{InMemoryTaskStore, TaskStore};
use sandbox_agent::{RunnerConfig, ServiceFactory, TaskRegistry, TaskRunner};

async fn open_store(cfg: &AppConfig) -> Result<Arc<dyn TaskStore>> {
    match cfg.database_url.as_deref().filter(|u| !u.is_empty()) {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = sandbox_agent::store::PgTaskStore::connect(url).await?;
            info!("using PostgreSQL task store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            warn!("DATABASE_URL set but built without the postgres feature; using in-memory store");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
        None => {
            info!("using in-memory task store");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
    }
}

fn spawn_cleanup(store: Arc<dyn TaskStore>, cfg: &AppConfig) {
    let retention = cfg.retention();
    let every = cfg.cleanup_interval();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            match store.cleanup(retention).await {
                Ok(n) if n > 0 => info!(removed = n, "removed expired tasks"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "task cleanup failed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::parse();
    cfg.init_tracing();

    let store = open_store(&cfg).await?;
    spawn_cleanup(store.clone(), &cfg);

    let factory = ServiceFactory::new(Arc::new(InMemoryRecall::new()));
    let runner = TaskRunner::new(
        store,
        TaskRegistry::new(),
        Arc::new(factory),
        RunnerConfig::for_lang(cfg.lang()),
    );
    let state = Arc::new(AppState { runner, log_level: cfg.log_level.clone() });

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(addr = %cfg.bind, "server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

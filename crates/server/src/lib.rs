//! Strata server wiring: one store, its garbage collector, the bus adapter and
//! the REST router, started and stopped together.

#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use strata_api::{router, AllowAll, BusServer, HttpConfig, InProcApi, SessionVerifier, StaticTokenVerifier};
use strata_bus::{Bus, MemoryBus};
use strata_persist::SqliteBackend;
use strata_store::{GarbageCollector, ObjectStore, StoreConfig};
use tracing::{info, warn};

/// Everything the binary reads from flags and `STRATA_*` variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// SQLite file; `None` keeps objects in memory only.
    pub db_path: Option<PathBuf>,
    /// `token=subject` pairs; empty admits every caller.
    pub auth_tokens: String,
    pub http: HttpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: None,
            auth_tokens: String::new(),
            http: HttpConfig::default(),
        }
    }
}

pub fn verifier(tokens: &str) -> Arc<dyn SessionVerifier> {
    let parsed = StaticTokenVerifier::parse(tokens);
    if parsed.is_empty() {
        warn!("server: no STRATA_AUTH_TOKENS configured; every caller is admitted");
        Arc::new(AllowAll)
    } else {
        info!(tokens = parsed.len(), "server: static token verifier");
        Arc::new(parsed)
    }
}

pub struct Server {
    config: ServerConfig,
    store: ObjectStore,
    bus: Arc<dyn Bus>,
    verifier: Arc<dyn SessionVerifier>,
    gc: GarbageCollector,
    bus_server: BusServer,
}

impl Server {
    /// Open the store (reloading from SQLite when configured) and start the
    /// background services. Nothing listens until [`Server::serve`].
    pub async fn build(config: ServerConfig, store_config: StoreConfig) -> Result<Self> {
        let store = match &config.db_path {
            Some(path) => {
                let path_str = path.to_str().with_context(|| format!("non UTF-8 db path {}", path.display()))?;
                let backend = SqliteBackend::open(path_str)?;
                let store = ObjectStore::with_backend(store_config, Arc::new(backend))
                    .with_context(|| format!("restoring objects from {}", path.display()))?;
                info!(db = %path.display(), objects = store.len(), revision = store.revision(), "server: store restored");
                store
            }
            None => {
                info!("server: in-memory store");
                ObjectStore::new(store_config)
            }
        };
        let verifier = verifier(&config.auth_tokens);
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::default());
        let gc = GarbageCollector::start(&store);
        let bus_server = BusServer::start(bus.clone(), store.clone(), verifier.clone())
            .await
            .context("starting bus adapter")?;
        Ok(Self { config, store, bus, verifier, gc, bus_server })
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The bus the adapter serves on, for in-process bus clients and watchers.
    pub fn bus(&self) -> Arc<dyn Bus> {
        self.bus.clone()
    }

    pub fn router(&self) -> axum::Router {
        let api = Arc::new(InProcApi::new(self.store.clone()));
        router(api, self.verifier.clone(), self.config.http.clone())
    }

    /// Serve HTTP on the configured address until `shutdown` resolves, then stop the background services.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("binding {}", self.config.listen))?;
        self.serve_on(listener, shutdown).await
    }

    pub async fn serve_on<F>(self, listener: tokio::net::TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().context("reading listener address")?;
        info!(addr = %addr, "server: listening");
        axum::serve(listener, self.router()).with_graceful_shutdown(shutdown).await.context("serving HTTP")?;
        self.stop().await;
        Ok(())
    }

    pub async fn stop(self) {
        self.bus_server.stop().await;
        self.gc.stop().await;
        info!(revision = self.store.revision(), "server: stopped");
    }
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum_server::Handle;
use tokio::{
    self,
    signal,
    sync::watch,
};
use tracing::info;

use crate::{
    config::ServerConfig,
    pools::PoolManager,
    queue::QueueManager,
    reclaimer::Reclaimer,
    routes::{create_routes, RouteState},
    scheduler::Scheduler,
    state_store::LineState,
};

#[derive(Clone)]
pub struct Service {
    pub config: Arc<ServerConfig>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub line_state: Arc<LineState>,
    pub queues: Arc<QueueManager>,
    pub scheduler: Arc<Scheduler>,
    pub pool_manager: Arc<PoolManager>,
    pub reclaimer: Arc<Reclaimer>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let line_state = LineState::new();
        let queues = QueueManager::new();
        queues.create_queue(&config.dead_letter_queue()).await;

        let scheduler = Scheduler::new(line_state.clone(), queues.clone(), config.clone());
        let pool_manager = PoolManager::new(
            line_state.clone(),
            queues.clone(),
            scheduler.clone(),
            config.clone(),
            shutdown_rx.clone(),
        );
        let reclaimer = Reclaimer::new(line_state.clone(), queues.clone(), config.clone());

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            line_state,
            queues,
            scheduler,
            pool_manager,
            reclaimer,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        self.reclaimer.start(self.shutdown_rx.clone());

        let route_state = RouteState {
            pool_manager: self.pool_manager.clone(),
            line_state: self.line_state.clone(),
            queues: self.queues.clone(),
            config: self.config.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr_sock_addr()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}

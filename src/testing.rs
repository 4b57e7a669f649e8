use anyhow::Result;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, service::Service};

pub struct TestService {
    pub service: Service,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        // Leases expire almost immediately so reclamation is observable
        // without waiting out production ttls.
        let cfg = ServerConfig {
            worker_ttl_secs: 1,
            alloc_ttl_secs: 0,
            replica_ttl_secs: 0,
            pool_ttl_secs: 1,
            retry_base_delay_secs: 0,
            max_retry: 2,
            ..Default::default()
        };
        let srv = Service::new(cfg).await?;

        Ok(Self { service: srv })
    }

    /// Run one reclamation pass, as the background loop would.
    pub async fn sweep(&self) {
        self.service.reclaimer.sweep().await;
    }
}

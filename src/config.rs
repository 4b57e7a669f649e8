use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Prefix for every queue name this deployment owns.
    pub deployment: String,
    pub pool_ttl_secs: u64,
    pub worker_ttl_secs: u64,
    pub alloc_ttl_secs: u64,
    pub replica_ttl_secs: u64,
    /// Attempts after which an eval is parked on the dead letter queue.
    pub max_retry: u32,
    pub retry_base_delay_secs: u64,
    pub sweep_interval_secs: u64,
    pub queue_wait_time_secs: u64,
    pub queue_visibility_timeout_secs: u64,
    /// How long a delivered alloc notification stays hidden before
    /// redelivery if the worker never acks it.
    pub notification_visibility_secs: u64,
    pub queue_batch_size: usize,
    pub structured_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8900".to_string(),
            deployment: "line".to_string(),
            pool_ttl_secs: 300,
            worker_ttl_secs: 60,
            alloc_ttl_secs: 60,
            replica_ttl_secs: 120,
            max_retry: 3,
            retry_base_delay_secs: 2,
            sweep_interval_secs: 5,
            queue_wait_time_secs: 20,
            queue_visibility_timeout_secs: 1,
            notification_visibility_secs: 30,
            queue_batch_size: 10,
            structured_logging: false,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::file(path))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid listen_addr {}: {}", self.listen_addr, e))?;
        if self.deployment.is_empty() {
            return Err(anyhow!("deployment can't be empty"));
        }
        if self.queue_batch_size == 0 {
            return Err(anyhow!("queue_batch_size can't be 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(anyhow!("sweep_interval_secs can't be 0"));
        }
        Ok(())
    }

    pub fn listen_addr_sock_addr(&self) -> Result<SocketAddr> {
        Ok(self.listen_addr.parse::<SocketAddr>()?)
    }

    /// Queue holding the evals waiting to be scheduled on a pool.
    pub fn pool_queue(&self, pool_id: &str) -> String {
        format!("{}-s{}", self.deployment, pool_id)
    }

    /// Queue a worker polls for allocation notifications.
    pub fn worker_queue(&self, pool_id: &str, worker_id: &str) -> String {
        format!("{}-{}-{}", self.deployment, pool_id, worker_id)
    }

    /// Evals that exhausted their retries land here.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}-dlq", self.deployment)
    }
}

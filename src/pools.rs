use std::{fmt, sync::Arc};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    data_model::{Alloc, AllocId, Eval, Pool, PoolId, Replica, ReplicaId, Worker, WorkerId},
    queue::QueueManager,
    scheduler::Scheduler,
    state_store::{LineState, StateError},
    utils::get_epoch_time_in_secs,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    State(StateError),
    Encoding(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(err) => err.fmt(f),
            Self::Encoding(msg) => write!(f, "failed to encode queue message: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<StateError> for PoolError {
    fn from(err: StateError) -> Self {
        Self::State(err)
    }
}

/// Entity lifecycle: pools, their workers, and the leases tied to them.
///
/// Creating a pool provisions its eval queue and starts its scheduler loop;
/// disbanding deletes the queue, which stops that loop, and leaves the
/// record behind with a ttl so in-flight leases drain before the reclaimer
/// purges it.
pub struct PoolManager {
    state: Arc<LineState>,
    queues: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    config: Arc<ServerConfig>,
    shutdown_rx: watch::Receiver<()>,
}

impl PoolManager {
    pub fn new(
        state: Arc<LineState>,
        queues: Arc<QueueManager>,
        scheduler: Arc<Scheduler>,
        config: Arc<ServerConfig>,
        shutdown_rx: watch::Receiver<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            queues,
            scheduler,
            config,
            shutdown_rx,
        })
    }

    pub async fn create_pool(&self, pool_id: Option<PoolId>) -> Result<Pool, PoolError> {
        let pool_id = pool_id.unwrap_or_else(PoolId::generate);
        let pool = Pool {
            queue_url: self.config.pool_queue(pool_id.get()),
            id: pool_id,
            ttl: 0,
        };
        // Queue before record, so a pool that exists is always schedulable.
        // A failed record write leaves a queue behind; creation is
        // idempotent, a retry under the same id picks it back up.
        self.queues.create_queue(&pool.queue_url).await;
        self.state.put_new_pool(pool.clone()).await?;
        self.scheduler
            .start_pool(pool.clone(), self.shutdown_rx.clone());
        info!(pool_id = pool.id.get(), "created pool");
        Ok(pool)
    }

    /// Disbanded pools are invisible here; their record only lingers for
    /// the reclaimer.
    pub async fn fetch_pool(&self, pool_id: &PoolId) -> Result<Pool, PoolError> {
        let pool = self.state.get_pool(pool_id).await?;
        if !pool.is_active() {
            return Err(StateError::PoolNotExists.into());
        }
        Ok(pool)
    }

    /// Idempotent: the queue delete is a no-op the second time and the ttl
    /// is only armed once.
    pub async fn disband_pool(&self, pool_id: &PoolId) -> Result<(), PoolError> {
        let pool = self.state.get_pool(pool_id).await?;
        self.queues.delete_queue(&pool.queue_url).await;
        if pool.is_active() {
            self.state
                .set_pool_ttl(pool_id, get_epoch_time_in_secs() + self.config.pool_ttl_secs)
                .await?;
            info!(pool_id = pool_id.get(), "disbanded pool");
        }
        Ok(())
    }

    pub async fn list_pools(&self) -> Vec<Pool> {
        self.state
            .list_pools()
            .await
            .into_iter()
            .filter(|pool| pool.is_active())
            .collect()
    }

    pub async fn register_worker(
        &self,
        pool_id: &PoolId,
        worker_id: Option<WorkerId>,
        capacity: i64,
        zone: Option<String>,
    ) -> Result<Worker, PoolError> {
        self.fetch_pool(pool_id).await?;
        let worker_id = worker_id.unwrap_or_else(WorkerId::generate);
        let worker = Worker {
            pool_id: pool_id.clone(),
            queue_url: self.config.worker_queue(pool_id.get(), worker_id.get()),
            id: worker_id,
            capacity,
            ttl: get_epoch_time_in_secs() + self.config.worker_ttl_secs,
            zone,
        };
        self.queues.create_queue(&worker.queue_url).await;
        self.state.put_new_worker(worker.clone()).await?;
        info!(
            pool_id = pool_id.get(),
            worker_id = worker.id.get(),
            capacity,
            "registered worker"
        );
        Ok(worker)
    }

    pub async fn deregister_worker(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
    ) -> Result<(), PoolError> {
        let worker = self.state.get_worker(pool_id, worker_id).await?;
        self.queues.delete_queue(&worker.queue_url).await;
        self.state.delete_worker(pool_id, worker_id).await?;
        info!(
            pool_id = pool_id.get(),
            worker_id = worker_id.get(),
            "deregistered worker"
        );
        Ok(())
    }

    /// Refresh the leases a worker reports as alive. The worker lease must
    /// still exist; an expired worker has to register again. Alloc
    /// refreshes are best effort, a lease the reclaimer already took back
    /// stays gone.
    pub async fn heartbeat(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
        datasets: &[String],
        alloc_ids: &[AllocId],
    ) -> Result<(), PoolError> {
        let now = get_epoch_time_in_secs();
        self.state
            .refresh_worker_ttl(pool_id, worker_id, now + self.config.worker_ttl_secs)
            .await?;
        for dataset in datasets {
            self.state
                .put_replica(Replica {
                    pool_id: pool_id.clone(),
                    id: ReplicaId::from_parts(dataset, worker_id),
                    ttl: now + self.config.replica_ttl_secs,
                })
                .await;
        }
        for alloc_id in alloc_ids {
            if let Err(err) = self
                .state
                .refresh_alloc_ttl(pool_id, alloc_id, worker_id, now + self.config.alloc_ttl_secs)
                .await
            {
                warn!(
                    alloc_id = alloc_id.get(),
                    worker_id = worker_id.get(),
                    "heartbeat for an alloc this worker no longer holds: {err}"
                );
            }
        }
        Ok(())
    }

    /// Enqueue an eval for scheduling. Sizes below one are clamped to one.
    pub async fn submit_eval(
        &self,
        pool_id: &PoolId,
        size: i64,
        dataset: Option<String>,
    ) -> Result<Eval, PoolError> {
        let pool = self.fetch_pool(pool_id).await?;
        let eval = Eval::new(pool_id.clone(), size.max(1), dataset);
        let body =
            serde_json::to_string(&eval).map_err(|err| PoolError::Encoding(err.to_string()))?;
        // A vanished queue means the pool was disbanded underneath us.
        self.queues
            .send(&pool.queue_url, body)
            .await
            .map_err(|_| StateError::PoolNotExists)?;
        info!(pool_id = pool_id.get(), eval_id = %eval.id, "submitted eval");
        Ok(eval)
    }

    /// Finish an allocation, returning its capacity to the worker. Errors
    /// on a second call for the same alloc.
    pub async fn complete_alloc(
        &self,
        pool_id: &PoolId,
        alloc_id: &AllocId,
    ) -> Result<Alloc, PoolError> {
        let alloc = self.state.release_alloc(pool_id, alloc_id).await?;
        info!(
            pool_id = pool_id.get(),
            alloc_id = alloc_id.get(),
            "completed alloc"
        );
        Ok(alloc)
    }

    pub async fn get_alloc(
        &self,
        pool_id: &PoolId,
        alloc_id: &AllocId,
    ) -> Result<Alloc, PoolError> {
        Ok(self.state.get_alloc(pool_id, alloc_id).await?)
    }
}

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    config::ServerConfig,
    data_model::{Alloc, Pool, Replica, Worker},
    queue::QueueManager,
    state_store::LineState,
    utils::get_epoch_time_in_secs,
};

/// Periodically reclaims leases the heartbeats stopped refreshing.
///
/// Expired allocs go back on their pool's queue for another attempt, or to
/// the dead letter queue once out of retries, and their capacity is credited
/// back. Expired workers lose their queue and record. Sweeps keep running
/// for disbanded pools so their remaining leases drain, and the pool record
/// itself is purged once its own ttl passes.
pub struct Reclaimer {
    state: Arc<LineState>,
    queues: Arc<QueueManager>,
    config: Arc<ServerConfig>,
}

impl Reclaimer {
    pub fn new(
        state: Arc<LineState>,
        queues: Arc<QueueManager>,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            queues,
            config,
        })
    }

    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let reclaimer = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(reclaimer.config.sweep_interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("stopping reclaimer");
                        return;
                    },
                    _ = interval.tick() => {
                        reclaimer.sweep().await;
                    },
                }
            }
        });
    }

    pub(crate) async fn sweep(&self) {
        let now = get_epoch_time_in_secs();
        for pool in self.state.list_pools().await {
            for alloc in self.state.expired_allocs(&pool.id, now).await {
                self.reclaim_alloc(&pool, alloc).await;
            }
            for worker in self.state.expired_workers(&pool.id, now).await {
                self.reclaim_worker(&pool, worker).await;
            }
            for replica in self.state.expired_replicas(&pool.id, now).await {
                self.reclaim_replica(&pool, replica).await;
            }
            if !pool.is_active() && pool.ttl < now {
                info!(pool_id = pool.id.get(), "purging disbanded pool");
                match self.state.purge_pool(&pool.id).await {
                    Ok(workers) => {
                        // Workers that outlived the pool still have
                        // notification queues to tear down.
                        for worker in workers {
                            self.queues.delete_queue(&worker.queue_url).await;
                        }
                    }
                    Err(err) => {
                        error!(pool_id = pool.id.get(), "failed to purge pool: {err}");
                    }
                }
            }
        }
    }

    /// Requeue or dead-letter the eval, then release the lease. Releasing
    /// last keeps the sweep crash-safe: a resend of the same attempt dedups
    /// at scheduling time.
    async fn reclaim_alloc(&self, pool: &Pool, alloc: Alloc) {
        let eval = &alloc.eval;
        let body = match serde_json::to_string(eval) {
            Ok(body) => body,
            Err(err) => {
                error!(alloc_id = alloc.id.get(), "failed to serialize eval: {err:?}");
                return;
            }
        };
        if eval.retry >= self.config.max_retry {
            warn!(
                alloc_id = alloc.id.get(),
                retry = eval.retry,
                "eval out of retries, moving to dead letter queue"
            );
            if let Err(err) = self.queues.send(&self.config.dead_letter_queue(), body).await {
                error!("failed to dead-letter eval: {err}");
                return;
            }
        } else {
            let delay = self.retry_delay(eval.retry);
            info!(
                alloc_id = alloc.id.get(),
                retry = eval.retry,
                delay_secs = delay.as_secs(),
                "alloc lease expired, requeueing eval"
            );
            match self.queues.send_delayed(&pool.queue_url, body, delay).await {
                Ok(()) => {}
                Err(err) => {
                    // Disbanded pool, the eval has nowhere to go.
                    warn!("dropping eval of a disbanded pool: {err}");
                }
            }
        }
        if let Err(err) = self.state.release_alloc(&pool.id, &alloc.id).await {
            warn!(alloc_id = alloc.id.get(), "failed to release expired alloc: {err}");
        }
    }

    /// Linear backoff with jitter so retries of a struggling pool don't
    /// arrive in lockstep.
    fn retry_delay(&self, retry: u32) -> Duration {
        let base = self.config.retry_base_delay_secs;
        let jitter = if base > 0 {
            rand::rng().random_range(0..base)
        } else {
            0
        };
        Duration::from_secs(u64::from(retry) * base + jitter)
    }

    async fn reclaim_worker(&self, pool: &Pool, worker: Worker) {
        info!(worker_id = worker.id.get(), "worker lease expired, removing");
        self.queues.delete_queue(&worker.queue_url).await;
        if let Err(err) = self.state.delete_worker(&pool.id, &worker.id).await {
            warn!(worker_id = worker.id.get(), "failed to delete expired worker: {err}");
        }
    }

    async fn reclaim_replica(&self, pool: &Pool, replica: Replica) {
        if let Err(err) = self.state.delete_replica(&pool.id, &replica.id).await {
            warn!(
                replica_id = replica.id.get(),
                "failed to delete expired replica: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_model::{
            test_objects::tests::{
                mock_eval, mock_pool, mock_replica, mock_worker, TEST_POOL_ID, TEST_WORKER_ID,
            },
            Eval, PoolId, WorkerId,
        },
        state_store::StateError,
    };

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            max_retry: 2,
            retry_base_delay_secs: 0,
            ..Default::default()
        })
    }

    async fn test_reclaimer() -> (Arc<Reclaimer>, Arc<LineState>, Arc<QueueManager>) {
        let state = LineState::new();
        let queues = QueueManager::new();
        let config = test_config();
        let pool = mock_pool();
        queues.create_queue(&pool.queue_url).await;
        queues.create_queue(&config.dead_letter_queue()).await;
        state.put_new_pool(pool).await.unwrap();
        let reclaimer = Reclaimer::new(state.clone(), queues.clone(), config);
        (reclaimer, state, queues)
    }

    async fn expired_alloc(state: &LineState, eval: Eval) -> Alloc {
        let alloc = Alloc {
            pool_id: PoolId::from(TEST_POOL_ID),
            id: eval.alloc_id(),
            worker_id: WorkerId::from(TEST_WORKER_ID),
            ttl: get_epoch_time_in_secs() - 10,
            eval,
        };
        state.put_new_alloc(alloc.clone()).await.unwrap();
        alloc
    }

    #[tokio::test]
    async fn test_expired_alloc_requeued_and_capacity_credited() {
        let (reclaimer, state, queues) = test_reclaimer().await;
        state.put_new_worker(mock_worker(10)).await.unwrap();

        let mut eval = mock_eval(4);
        eval.retry = 1;
        state
            .claim_capacity(&eval.pool, &WorkerId::from(TEST_WORKER_ID), 4)
            .await
            .unwrap();
        let alloc = expired_alloc(&state, eval).await;

        reclaimer.sweep().await;

        assert_eq!(
            state.get_alloc(&alloc.pool_id, &alloc.id).await,
            Err(StateError::AllocNotExists)
        );
        let worker = state
            .get_worker(&alloc.pool_id, &alloc.worker_id)
            .await
            .unwrap();
        assert_eq!(worker.capacity, 10);

        // Requeued with its retry count intact.
        let messages = queues
            .receive(
                &mock_pool().queue_url,
                10,
                Duration::from_secs(1),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let requeued: Eval = serde_json::from_str(&messages[0].body).unwrap();
        assert_eq!(requeued.retry, 1);
        assert_eq!(requeued.id, alloc.eval.id);
    }

    #[tokio::test]
    async fn test_exhausted_eval_goes_to_dead_letter_queue() {
        let (reclaimer, state, queues) = test_reclaimer().await;
        state.put_new_worker(mock_worker(10)).await.unwrap();

        let mut eval = mock_eval(1);
        eval.retry = 2;
        expired_alloc(&state, eval).await;

        reclaimer.sweep().await;

        let pool_messages = queues
            .receive(
                &mock_pool().queue_url,
                10,
                Duration::from_millis(50),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(pool_messages.is_empty());

        let dlq_messages = queues
            .receive(
                &test_config().dead_letter_queue(),
                10,
                Duration::from_secs(1),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(dlq_messages.len(), 1);
    }

    #[tokio::test]
    async fn test_live_alloc_survives_sweep() {
        let (reclaimer, state, _queues) = test_reclaimer().await;
        state.put_new_worker(mock_worker(10)).await.unwrap();

        let eval = mock_eval(1);
        let alloc = Alloc {
            pool_id: PoolId::from(TEST_POOL_ID),
            id: eval.alloc_id(),
            worker_id: WorkerId::from(TEST_WORKER_ID),
            ttl: get_epoch_time_in_secs() + 60,
            eval,
        };
        state.put_new_alloc(alloc.clone()).await.unwrap();

        reclaimer.sweep().await;

        state.get_alloc(&alloc.pool_id, &alloc.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_worker_is_torn_down() {
        let (reclaimer, state, queues) = test_reclaimer().await;
        let mut worker = mock_worker(5);
        worker.ttl = get_epoch_time_in_secs() - 10;
        queues.create_queue(&worker.queue_url).await;
        state.put_new_worker(worker.clone()).await.unwrap();

        reclaimer.sweep().await;

        assert_eq!(
            state.get_worker(&worker.pool_id, &worker.id).await,
            Err(StateError::WorkerNotExists)
        );
        assert_eq!(
            queues.send(&worker.queue_url, "x".to_string()).await,
            Err(crate::queue::QueueError::NotExists)
        );
    }

    #[tokio::test]
    async fn test_expired_replica_is_removed() {
        let (reclaimer, state, _queues) = test_reclaimer().await;
        let mut replica = mock_replica("ds1", "w1");
        replica.ttl = get_epoch_time_in_secs() - 10;
        state.put_replica(replica.clone()).await;

        reclaimer.sweep().await;

        assert!(state
            .replicas_for_dataset(&replica.pool_id, "ds1")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_disbanded_pool_is_purged_after_ttl() {
        let (reclaimer, state, _queues) = test_reclaimer().await;
        let pool_id = PoolId::from(TEST_POOL_ID);
        state
            .set_pool_ttl(&pool_id, get_epoch_time_in_secs() - 10)
            .await
            .unwrap();

        reclaimer.sweep().await;

        assert_eq!(
            state.get_pool(&pool_id).await,
            Err(StateError::PoolNotExists)
        );
    }

    #[tokio::test]
    async fn test_purge_tears_down_surviving_worker_queues() {
        let (reclaimer, state, queues) = test_reclaimer().await;
        let worker = mock_worker(10);
        queues.create_queue(&worker.queue_url).await;
        state.put_new_worker(worker.clone()).await.unwrap();

        let mut eval = mock_eval(1);
        eval.retry = 1;
        let alloc = Alloc {
            pool_id: worker.pool_id.clone(),
            id: eval.alloc_id(),
            worker_id: worker.id.clone(),
            ttl: get_epoch_time_in_secs() + 60,
            eval,
        };
        state.put_new_alloc(alloc).await.unwrap();

        state
            .set_pool_ttl(&worker.pool_id, get_epoch_time_in_secs() - 10)
            .await
            .unwrap();

        reclaimer.sweep().await;

        // The worker's record and its queue both go with the pool.
        assert_eq!(
            state.get_worker(&worker.pool_id, &worker.id).await,
            Err(StateError::WorkerNotExists)
        );
        assert_eq!(
            queues.send(&worker.queue_url, "x".to_string()).await,
            Err(crate::queue::QueueError::NotExists)
        );
    }
}

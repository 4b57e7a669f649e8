use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::ServerConfig,
    data_model::{Alloc, AllocNotification, Eval, Pool, Worker, WorkerId},
    queue::{QueueError, QueueManager},
    state_store::{LineState, StateError},
    utils::get_epoch_time_in_secs,
};

/// Upper bound on placement candidates considered per attempt.
const CANDIDATE_LIMIT: usize = 10;

/// Consumes evals from pool queues and turns them into allocations.
///
/// Placement is optimistic: candidates are read without a lock, then the
/// best one is claimed with a guarded capacity decrement. A lost claim fails
/// the whole attempt instead of falling through, since the rest of the list
/// is just as stale; redelivery re-queries. The allocation id is derived
/// from the eval id and its attempt counter, so a redelivered message
/// resolves to the attempt that already succeeded instead of claiming
/// capacity again.
pub struct Scheduler {
    state: Arc<LineState>,
    queues: Arc<QueueManager>,
    config: Arc<ServerConfig>,
}

impl Scheduler {
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

    /// Spawn the consume loop for a pool's eval queue. The loop runs until
    /// shutdown or until the queue disappears, which is how disbanding a
    /// pool stops its scheduler.
    pub fn start_pool(
        self: &Arc<Self>,
        pool: Pool,
        shutdown_rx: watch::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let span = info_span!("pool_scheduler", pool_id = pool.id.get());
        tokio::spawn(
            async move {
                scheduler.run_pool(pool, shutdown_rx).await;
            }
            .instrument(span),
        )
    }

    async fn run_pool(self: Arc<Self>, pool: Pool, mut shutdown_rx: watch::Receiver<()>) {
        info!("starting pool scheduler");
        let wait = Duration::from_secs(self.config.queue_wait_time_secs);
        let visibility = Duration::from_secs(self.config.queue_visibility_timeout_secs);
        loop {
            let received = tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("stopping pool scheduler");
                    return;
                },
                received = self.queues.receive(
                    &pool.queue_url,
                    self.config.queue_batch_size,
                    wait,
                    visibility,
                ) => received,
            };
            let messages = match received {
                Ok(messages) => messages,
                Err(QueueError::NotExists) => {
                    info!("pool queue deleted, stopping pool scheduler");
                    return;
                }
            };
            for message in messages {
                let eval: Eval = match serde_json::from_str(&message.body) {
                    Ok(eval) => eval,
                    Err(err) => {
                        error!("dropping undecodable eval message: {err:?}");
                        let _ = self
                            .queues
                            .delete_message(&pool.queue_url, &message.receipt_handle)
                            .await;
                        continue;
                    }
                };
                match self.schedule_eval(eval).await {
                    Ok(_) => {
                        if let Err(err) = self
                            .queues
                            .delete_message(&pool.queue_url, &message.receipt_handle)
                            .await
                        {
                            warn!("failed to ack scheduled eval: {err}");
                        }
                    }
                    Err(err) => {
                        // Leave the message inflight; the visibility timeout
                        // redelivers it for another attempt.
                        debug!("eval not placed, leaving for redelivery: {err}");
                    }
                }
            }
        }
    }

    /// Attempt to place one eval. `Ok` means the message is consumed, either
    /// because an allocation now exists for this attempt or because one
    /// already did. `Err` means no worker could take it right now.
    pub async fn schedule_eval(&self, mut eval: Eval) -> Result<Alloc> {
        // Queue messages are untrusted; a missing or negative size claims
        // one unit, never zero or a credit.
        eval.size = eval.size.max(1);
        eval.retry += 1;
        let alloc_id = eval.alloc_id();

        // A redelivery of an attempt that already went through.
        if let Ok(alloc) = self.state.get_alloc(&eval.pool, &alloc_id).await {
            debug!(alloc_id = alloc_id.get(), "attempt already allocated");
            return Ok(alloc);
        }

        let candidates = self.candidates_for(&eval).await;
        let Some(worker) = candidates.into_iter().next() else {
            return Err(anyhow!("no worker with capacity {}", eval.size));
        };

        match self
            .state
            .claim_capacity(&eval.pool, &worker.id, eval.size)
            .await
        {
            Ok(()) => {}
            Err(StateError::WorkerNotEnoughCapacity) | Err(StateError::WorkerNotExists) => {
                // Lost the race to a concurrent claim. The remaining
                // candidates were read at the same instant, so don't trust
                // them either; redelivery re-queries.
                return Err(anyhow!("placement candidate lost a capacity race"));
            }
            Err(err) => return Err(err.into()),
        }

        let alloc = Alloc {
            pool_id: eval.pool.clone(),
            id: alloc_id.clone(),
            worker_id: worker.id.clone(),
            ttl: get_epoch_time_in_secs() + self.config.alloc_ttl_secs,
            eval: eval.clone(),
        };
        match self.state.put_new_alloc(alloc.clone()).await {
            Ok(()) => {}
            Err(StateError::AllocExists) => {
                // Another consumer finished this attempt between our dedup
                // check and the claim. Undo the claim.
                self.state
                    .credit_capacity(&eval.pool, &worker.id, eval.size)
                    .await?;
                let alloc = self.state.get_alloc(&eval.pool, &alloc_id).await?;
                return Ok(alloc);
            }
            Err(err) => return Err(err.into()),
        }

        self.notify_worker(&alloc, &worker).await;
        info!(
            alloc_id = alloc.id.get(),
            worker_id = worker.id.get(),
            size = eval.size,
            retry = eval.retry,
            "placed eval"
        );
        Ok(alloc)
    }

    /// Candidates with room for the eval, best first: workers holding a
    /// replica of its dataset, then workers in the same zone as a holder,
    /// then everyone else, highest spare capacity first within each group.
    async fn candidates_for(&self, eval: &Eval) -> Vec<Worker> {
        let workers = self
            .state
            .workers_with_capacity(&eval.pool, eval.size, CANDIDATE_LIMIT)
            .await;

        let Some(dataset) = &eval.dataset else {
            return workers;
        };
        let mut holders = HashSet::new();
        let mut holder_zones = HashSet::new();
        for replica in self.state.replicas_for_dataset(&eval.pool, dataset).await {
            let worker_id = replica.id.worker_id();
            if let Ok(worker) = self.state.get_worker(&eval.pool, &worker_id).await {
                if let Some(zone) = worker.zone {
                    holder_zones.insert(zone);
                }
            }
            holders.insert(worker_id);
        }
        order_candidates(&holders, &holder_zones, workers)
    }

    async fn notify_worker(&self, alloc: &Alloc, worker: &Worker) {
        let notification = AllocNotification {
            pool_id: alloc.pool_id.clone(),
            alloc_id: alloc.id.clone(),
            worker_id: worker.id.clone(),
        };
        let body = match serde_json::to_string(&notification) {
            Ok(body) => body,
            Err(err) => {
                error!("failed to serialize alloc notification: {err:?}");
                return;
            }
        };
        // A missing worker queue means the worker is being torn down; the
        // allocation stays and the ttl sweep reclaims it.
        if let Err(err) = self.queues.send(&worker.queue_url, body).await {
            warn!(
                worker_id = worker.id.get(),
                "failed to notify worker of alloc: {err}"
            );
        }
    }
}

/// Stable by group, so the capacity-descending order of the input is kept
/// within each group.
fn order_candidates(
    holders: &HashSet<WorkerId>,
    holder_zones: &HashSet<String>,
    mut workers: Vec<Worker>,
) -> Vec<Worker> {
    workers.sort_by_key(|worker| {
        if holders.contains(&worker.id) {
            0
        } else if worker
            .zone
            .as_ref()
            .is_some_and(|zone| holder_zones.contains(zone))
        {
            1
        } else {
            2
        }
    });
    workers
}

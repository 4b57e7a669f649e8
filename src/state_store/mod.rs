pub mod in_memory_state;

use std::{fmt, sync::Arc};

use tokio::sync::RwLock;
use tracing::warn;

use crate::{
    data_model::{Alloc, AllocId, Pool, PoolId, Replica, ReplicaId, Worker, WorkerId},
    state_store::in_memory_state::InMemoryState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    PoolExists,
    PoolNotExists,
    WorkerExists,
    WorkerNotExists,
    WorkerNotEnoughCapacity,
    AllocExists,
    AllocNotExists,
    ReplicaNotExists,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExists => write!(f, "pool already exists"),
            Self::PoolNotExists => write!(f, "pool doesn't exist"),
            Self::WorkerExists => write!(f, "worker already exists"),
            Self::WorkerNotExists => write!(f, "worker doesn't exist"),
            Self::WorkerNotEnoughCapacity => write!(f, "worker doesn't have enough capacity"),
            Self::AllocExists => write!(f, "alloc already exists"),
            Self::AllocNotExists => write!(f, "alloc doesn't exist"),
            Self::ReplicaNotExists => write!(f, "replica doesn't exist"),
        }
    }
}

impl std::error::Error for StateError {}

/// The authoritative record store. All conditional updates take the write
/// lock, check their guard, and apply in one section, so each operation is
/// atomic with respect to every other.
pub struct LineState {
    pub in_memory_state: RwLock<InMemoryState>,
}

impl LineState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_memory_state: RwLock::new(InMemoryState::default()),
        })
    }

    pub async fn put_new_pool(&self, pool: Pool) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        if state.pools.contains_key(&pool.id) {
            return Err(StateError::PoolExists);
        }
        state.pools.insert(pool.id.clone(), Box::new(pool));
        Ok(())
    }

    pub async fn get_pool(&self, pool_id: &PoolId) -> Result<Pool, StateError> {
        let state = self.in_memory_state.read().await;
        state
            .pools
            .get(pool_id)
            .map(|p| (**p).clone())
            .ok_or(StateError::PoolNotExists)
    }

    pub async fn list_pools(&self) -> Vec<Pool> {
        let state = self.in_memory_state.read().await;
        state.pools.values().map(|p| (**p).clone()).collect()
    }

    pub async fn set_pool_ttl(&self, pool_id: &PoolId, ttl: u64) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        let mut pool = state
            .pools
            .get(pool_id)
            .map(|p| (**p).clone())
            .ok_or(StateError::PoolNotExists)?;
        pool.ttl = ttl;
        state.pools.insert(pool_id.clone(), Box::new(pool));
        Ok(())
    }

    /// Remove a pool and everything still belonging to it. Returns the
    /// workers that were still present so the caller can tear down their
    /// queues.
    pub async fn purge_pool(&self, pool_id: &PoolId) -> Result<Vec<Worker>, StateError> {
        let mut state = self.in_memory_state.write().await;
        state
            .pools
            .remove(pool_id)
            .ok_or(StateError::PoolNotExists)?;
        let worker_ids: Vec<WorkerId> = state
            .workers
            .keys()
            .filter(|(pool, _)| pool == pool_id)
            .map(|(_, worker_id)| worker_id.clone())
            .collect();
        let mut purged_workers = Vec::new();
        for worker_id in worker_ids {
            if let Some(worker) = state.remove_worker(pool_id, &worker_id) {
                purged_workers.push(*worker);
            }
        }
        let alloc_ids: Vec<AllocId> = state
            .allocs
            .keys()
            .filter(|(pool, _)| pool == pool_id)
            .map(|(_, alloc_id)| alloc_id.clone())
            .collect();
        for alloc_id in alloc_ids {
            state.remove_alloc(pool_id, &alloc_id);
        }
        let replica_ids: Vec<ReplicaId> = state
            .replicas
            .keys()
            .filter(|(pool, _)| pool == pool_id)
            .map(|(_, replica_id)| replica_id.clone())
            .collect();
        for replica_id in replica_ids {
            state.remove_replica(pool_id, &replica_id);
        }
        Ok(purged_workers)
    }

    pub async fn put_new_worker(&self, worker: Worker) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        if state
            .workers
            .contains_key(&(worker.pool_id.clone(), worker.id.clone()))
        {
            return Err(StateError::WorkerExists);
        }
        state.insert_worker(worker);
        Ok(())
    }

    pub async fn get_worker(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
    ) -> Result<Worker, StateError> {
        let state = self.in_memory_state.read().await;
        state
            .workers
            .get(&(pool_id.clone(), worker_id.clone()))
            .map(|w| (**w).clone())
            .ok_or(StateError::WorkerNotExists)
    }

    pub async fn delete_worker(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
    ) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        state
            .remove_worker(pool_id, worker_id)
            .map(|_| ())
            .ok_or(StateError::WorkerNotExists)
    }

    pub async fn refresh_worker_ttl(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
        ttl: u64,
    ) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        let mut worker = state
            .workers
            .get(&(pool_id.clone(), worker_id.clone()))
            .map(|w| (**w).clone())
            .ok_or(StateError::WorkerNotExists)?;
        worker.ttl = ttl;
        state.update_worker(worker);
        Ok(())
    }

    /// Decrement a worker's capacity, guarded on `capacity >= delta`. This
    /// is the claim half of an allocation.
    pub async fn claim_capacity(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
        delta: i64,
    ) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        let mut worker = state
            .workers
            .get(&(pool_id.clone(), worker_id.clone()))
            .map(|w| (**w).clone())
            .ok_or(StateError::WorkerNotExists)?;
        if worker.capacity < delta {
            return Err(StateError::WorkerNotEnoughCapacity);
        }
        worker.capacity -= delta;
        state.update_worker(worker);
        Ok(())
    }

    pub async fn credit_capacity(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
        delta: i64,
    ) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        let mut worker = state
            .workers
            .get(&(pool_id.clone(), worker_id.clone()))
            .map(|w| (**w).clone())
            .ok_or(StateError::WorkerNotExists)?;
        worker.capacity += delta;
        state.update_worker(worker);
        Ok(())
    }

    pub async fn workers_with_capacity(
        &self,
        pool_id: &PoolId,
        min: i64,
        limit: usize,
    ) -> Vec<Worker> {
        let state = self.in_memory_state.read().await;
        state.workers_with_capacity(pool_id, min, limit)
    }

    pub async fn expired_workers(&self, pool_id: &PoolId, now: u64) -> Vec<Worker> {
        let state = self.in_memory_state.read().await;
        state.expired_workers(pool_id, now)
    }

    pub async fn put_new_alloc(&self, alloc: Alloc) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        if state
            .allocs
            .contains_key(&(alloc.pool_id.clone(), alloc.id.clone()))
        {
            return Err(StateError::AllocExists);
        }
        state.insert_alloc(alloc);
        Ok(())
    }

    pub async fn get_alloc(
        &self,
        pool_id: &PoolId,
        alloc_id: &AllocId,
    ) -> Result<Alloc, StateError> {
        let state = self.in_memory_state.read().await;
        state
            .allocs
            .get(&(pool_id.clone(), alloc_id.clone()))
            .map(|a| (**a).clone())
            .ok_or(StateError::AllocNotExists)
    }

    /// Refresh an alloc's ttl, guarded on the alloc still being held by
    /// `worker_id`. A heartbeat racing a reclamation sweep loses cleanly.
    pub async fn refresh_alloc_ttl(
        &self,
        pool_id: &PoolId,
        alloc_id: &AllocId,
        worker_id: &WorkerId,
        ttl: u64,
    ) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        let mut alloc = state
            .allocs
            .get(&(pool_id.clone(), alloc_id.clone()))
            .map(|a| (**a).clone())
            .ok_or(StateError::AllocNotExists)?;
        if alloc.worker_id != *worker_id {
            return Err(StateError::AllocNotExists);
        }
        state.remove_alloc(pool_id, alloc_id);
        alloc.ttl = ttl;
        state.insert_alloc(alloc);
        Ok(())
    }

    /// Delete an alloc and credit its capacity back to the worker in one
    /// atomic step. Succeeds at most once per alloc, so a completion racing
    /// the reclamation sweep can never double-credit. A missing worker is
    /// tolerated; its record and capacity were already reaped.
    pub async fn release_alloc(
        &self,
        pool_id: &PoolId,
        alloc_id: &AllocId,
    ) -> Result<Alloc, StateError> {
        let mut state = self.in_memory_state.write().await;
        let alloc = state
            .remove_alloc(pool_id, alloc_id)
            .ok_or(StateError::AllocNotExists)?;
        match state
            .workers
            .get(&(pool_id.clone(), alloc.worker_id.clone()))
        {
            Some(worker) => {
                let mut worker = (**worker).clone();
                worker.capacity += alloc.eval.size;
                state.update_worker(worker);
            }
            None => {
                warn!(
                    pool_id = pool_id.get(),
                    worker_id = alloc.worker_id.get(),
                    alloc_id = alloc.id.get(),
                    "released alloc for a worker that no longer exists"
                );
            }
        }
        Ok(*alloc)
    }

    pub async fn expired_allocs(&self, pool_id: &PoolId, now: u64) -> Vec<Alloc> {
        let state = self.in_memory_state.read().await;
        state.expired_allocs(pool_id, now)
    }

    pub async fn put_replica(&self, replica: Replica) {
        let mut state = self.in_memory_state.write().await;
        state.insert_replica(replica);
    }

    pub async fn delete_replica(
        &self,
        pool_id: &PoolId,
        replica_id: &ReplicaId,
    ) -> Result<(), StateError> {
        let mut state = self.in_memory_state.write().await;
        state
            .remove_replica(pool_id, replica_id)
            .map(|_| ())
            .ok_or(StateError::ReplicaNotExists)
    }

    pub async fn replicas_for_dataset(&self, pool_id: &PoolId, dataset: &str) -> Vec<Replica> {
        let state = self.in_memory_state.read().await;
        state.replicas_for_dataset(pool_id, dataset)
    }

    pub async fn expired_replicas(&self, pool_id: &PoolId, now: u64) -> Vec<Replica> {
        let state = self.in_memory_state.read().await;
        state.expired_replicas(pool_id, now)
    }
}

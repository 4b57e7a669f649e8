use crate::data_model::{Alloc, AllocId, Pool, PoolId, Replica, ReplicaId, Worker, WorkerId};

/// Secondary index key for the capacity-ordered worker index. Ordering is
/// (pool, capacity, worker), so a range scan from (pool, min, "") yields all
/// workers of a pool with at least `min` capacity in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapacityKey {
    pub pool_id: PoolId,
    pub capacity: i64,
    pub worker_id: WorkerId,
}

/// Secondary index key for the TTL-ordered sweeps. Ordering is
/// (pool, ttl, id), so a range scan up to (pool, now, "") yields the
/// expired records of a pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TtlKey {
    pub pool_id: PoolId,
    pub ttl: u64,
    pub id: String,
}

/// All records plus the secondary indexes the scheduler and the reclaimer
/// query. Mutated only through `LineState`, which holds it behind a write
/// lock; every conditional update is check-and-apply within one lock
/// section, which is what gives the store its CAS semantics.
#[derive(Clone)]
pub struct InMemoryState {
    pub pools: im::OrdMap<PoolId, Box<Pool>>,
    pub workers: im::HashMap<(PoolId, WorkerId), Box<Worker>>,
    pub allocs: im::HashMap<(PoolId, AllocId), Box<Alloc>>,
    pub replicas: im::OrdMap<(PoolId, ReplicaId), Box<Replica>>,

    pub workers_by_capacity: im::OrdSet<CapacityKey>,
    pub workers_by_ttl: im::OrdSet<TtlKey>,
    pub allocs_by_ttl: im::OrdSet<TtlKey>,
    pub replicas_by_ttl: im::OrdSet<TtlKey>,
}

impl Default for InMemoryState {
    fn default() -> Self {
        Self {
            pools: im::OrdMap::new(),
            workers: im::HashMap::new(),
            allocs: im::HashMap::new(),
            replicas: im::OrdMap::new(),
            workers_by_capacity: im::OrdSet::new(),
            workers_by_ttl: im::OrdSet::new(),
            allocs_by_ttl: im::OrdSet::new(),
            replicas_by_ttl: im::OrdSet::new(),
        }
    }
}

impl InMemoryState {
    pub fn insert_worker(&mut self, worker: Worker) {
        self.workers_by_capacity.insert(CapacityKey {
            pool_id: worker.pool_id.clone(),
            capacity: worker.capacity,
            worker_id: worker.id.clone(),
        });
        self.workers_by_ttl.insert(TtlKey {
            pool_id: worker.pool_id.clone(),
            ttl: worker.ttl,
            id: worker.id.get().to_string(),
        });
        self.workers.insert(
            (worker.pool_id.clone(), worker.id.clone()),
            Box::new(worker),
        );
    }

    pub fn remove_worker(&mut self, pool_id: &PoolId, worker_id: &WorkerId) -> Option<Box<Worker>> {
        let worker = self.workers.remove(&(pool_id.clone(), worker_id.clone()))?;
        self.workers_by_capacity.remove(&CapacityKey {
            pool_id: worker.pool_id.clone(),
            capacity: worker.capacity,
            worker_id: worker.id.clone(),
        });
        self.workers_by_ttl.remove(&TtlKey {
            pool_id: worker.pool_id.clone(),
            ttl: worker.ttl,
            id: worker.id.get().to_string(),
        });
        Some(worker)
    }

    /// Re-index and store a worker whose capacity or ttl changed.
    pub fn update_worker(&mut self, updated: Worker) {
        self.remove_worker(&updated.pool_id.clone(), &updated.id.clone());
        self.insert_worker(updated);
    }

    pub fn insert_alloc(&mut self, alloc: Alloc) {
        self.allocs_by_ttl.insert(TtlKey {
            pool_id: alloc.pool_id.clone(),
            ttl: alloc.ttl,
            id: alloc.id.get().to_string(),
        });
        self.allocs
            .insert((alloc.pool_id.clone(), alloc.id.clone()), Box::new(alloc));
    }

    pub fn remove_alloc(&mut self, pool_id: &PoolId, alloc_id: &AllocId) -> Option<Box<Alloc>> {
        let alloc = self.allocs.remove(&(pool_id.clone(), alloc_id.clone()))?;
        self.allocs_by_ttl.remove(&TtlKey {
            pool_id: alloc.pool_id.clone(),
            ttl: alloc.ttl,
            id: alloc.id.get().to_string(),
        });
        Some(alloc)
    }

    pub fn insert_replica(&mut self, replica: Replica) {
        // Upsert: drop the stale ttl index entry first.
        if let Some(prev) = self
            .replicas
            .get(&(replica.pool_id.clone(), replica.id.clone()))
        {
            self.replicas_by_ttl.remove(&TtlKey {
                pool_id: prev.pool_id.clone(),
                ttl: prev.ttl,
                id: prev.id.get().to_string(),
            });
        }
        self.replicas_by_ttl.insert(TtlKey {
            pool_id: replica.pool_id.clone(),
            ttl: replica.ttl,
            id: replica.id.get().to_string(),
        });
        self.replicas.insert(
            (replica.pool_id.clone(), replica.id.clone()),
            Box::new(replica),
        );
    }

    pub fn remove_replica(
        &mut self,
        pool_id: &PoolId,
        replica_id: &ReplicaId,
    ) -> Option<Box<Replica>> {
        let replica = self.replicas.remove(&(pool_id.clone(), replica_id.clone()))?;
        self.replicas_by_ttl.remove(&TtlKey {
            pool_id: replica.pool_id.clone(),
            ttl: replica.ttl,
            id: replica.id.get().to_string(),
        });
        Some(replica)
    }

    /// Workers of a pool with `capacity >= min`, highest capacity first,
    /// bounded to `limit` candidates.
    pub fn workers_with_capacity(&self, pool_id: &PoolId, min: i64, limit: usize) -> Vec<Worker> {
        let start = CapacityKey {
            pool_id: pool_id.clone(),
            capacity: min,
            worker_id: WorkerId::default(),
        };
        let matching: Vec<&CapacityKey> = self
            .workers_by_capacity
            .range(start..)
            .take_while(|key| key.pool_id == *pool_id)
            .collect();
        matching
            .iter()
            .rev()
            .take(limit)
            .filter_map(|key| {
                self.workers
                    .get(&(key.pool_id.clone(), key.worker_id.clone()))
                    .map(|w| (**w).clone())
            })
            .collect()
    }

    /// Replicas of a pool whose id starts with `dataset:`.
    pub fn replicas_for_dataset(&self, pool_id: &PoolId, dataset: &str) -> Vec<Replica> {
        let prefix = format!("{dataset}:");
        let start = (
            pool_id.clone(),
            ReplicaId::from_parts(dataset, &WorkerId::default()),
        );
        self.replicas
            .range(start..)
            .take_while(|((pool, rid), _)| pool == pool_id && rid.get().starts_with(&prefix))
            .map(|(_, replica)| (**replica).clone())
            .collect()
    }

    fn expired_keys(index: &im::OrdSet<TtlKey>, pool_id: &PoolId, now: u64) -> Vec<TtlKey> {
        let start = TtlKey {
            pool_id: pool_id.clone(),
            ttl: 0,
            id: String::new(),
        };
        index
            .range(start..)
            .take_while(|key| key.pool_id == *pool_id && key.ttl < now)
            .cloned()
            .collect()
    }

    pub fn expired_workers(&self, pool_id: &PoolId, now: u64) -> Vec<Worker> {
        Self::expired_keys(&self.workers_by_ttl, pool_id, now)
            .iter()
            .filter_map(|key| {
                self.workers
                    .get(&(key.pool_id.clone(), WorkerId::new(key.id.clone())))
                    .map(|w| (**w).clone())
            })
            .collect()
    }

    pub fn expired_allocs(&self, pool_id: &PoolId, now: u64) -> Vec<Alloc> {
        Self::expired_keys(&self.allocs_by_ttl, pool_id, now)
            .iter()
            .filter_map(|key| {
                self.allocs
                    .get(&(key.pool_id.clone(), AllocId::new(key.id.clone())))
                    .map(|a| (**a).clone())
            })
            .collect()
    }

    pub fn expired_replicas(&self, pool_id: &PoolId, now: u64) -> Vec<Replica> {
        Self::expired_keys(&self.replicas_by_ttl, pool_id, now)
            .iter()
            .filter_map(|key| {
                self.replicas
                    .get(&(key.pool_id.clone(), ReplicaId::from_raw(key.id.clone())))
                    .map(|r| (**r).clone())
            })
            .collect()
    }
}

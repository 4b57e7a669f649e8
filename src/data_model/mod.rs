
use std::{fmt, ops::Deref};

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(nanoid!())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PoolId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(nanoid!())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[serde(transparent)]
pub struct AllocId(String);

impl AllocId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for AllocId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for AllocId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A pool is a capacity domain with its own evaluation queue. `ttl == 0`
/// means the pool is active; a positive value is the unix timestamp at which
/// a disbanded pool becomes eligible for final garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub id: PoolId,
    pub queue_url: String,
    pub ttl: u64,
}

impl Pool {
    pub fn is_active(&self) -> bool {
        self.ttl == 0
    }
}

/// A worker provides capacity to a pool. Capacity is only ever mutated
/// through guarded decrements and credits on the store, never read-modify-
/// write, which is what keeps concurrent claims correct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub pool_id: PoolId,
    pub id: WorkerId,
    pub capacity: i64,
    pub queue_url: String,
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

/// A scheduling request. Evals are never persisted standalone: they live as
/// queue message bodies and embedded inside the allocation they produced.
///
/// `id` is assigned once at submission and survives retries; together with
/// the retry counter it yields a deterministic allocation id per attempt,
/// so a redelivered message cannot claim capacity twice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Eval {
    pub id: String,
    pub pool: PoolId,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default)]
    pub retry: u32,
}

impl Eval {
    pub fn new(pool: PoolId, size: i64, dataset: Option<String>) -> Self {
        Self {
            id: nanoid!(),
            pool,
            size,
            dataset,
            retry: 0,
        }
    }

    /// The allocation id this eval produces on its current attempt.
    pub fn alloc_id(&self) -> AllocId {
        AllocId::new(format!("{}-{}", self.id, self.retry))
    }
}

/// A granted capacity claim. Its existence corresponds 1:1 with a claim of
/// `eval.size` units on `worker_id`; claim and record are created together
/// and released together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alloc {
    pub pool_id: PoolId,
    pub id: AllocId,
    pub worker_id: WorkerId,
    pub ttl: u64,
    pub eval: Eval,
}

/// A replica records that a worker currently holds a local copy of a
/// dataset. Refreshed by heartbeats, reaped by the TTL sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replica {
    pub pool_id: PoolId,
    pub id: ReplicaId,
    pub ttl: u64,
}

/// Replica identity encodes `dataset:worker` so replicas for one dataset
/// form a contiguous key range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn from_parts(dataset: &str, worker_id: &WorkerId) -> Self {
        Self(format!("{}:{}", dataset, worker_id))
    }

    pub fn from_raw(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    pub fn dataset(&self) -> &str {
        self.0.split_once(':').map(|(d, _)| d).unwrap_or(&self.0)
    }

    pub fn worker_id(&self) -> WorkerId {
        self.0
            .split_once(':')
            .map(|(_, w)| WorkerId::new(w.to_string()))
            .unwrap_or_default()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message body delivered to a worker's queue when an allocation lands on
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocNotification {
    pub pool_id: PoolId,
    pub alloc_id: AllocId,
    pub worker_id: WorkerId,
}

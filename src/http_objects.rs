use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{data_model, pools::PoolError, queue::QueueError, state_store::StateError};

#[derive(Debug, Serialize, Deserialize)]
pub struct LineAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl LineAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }
}

impl IntoResponse for LineAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<StateError> for LineAPIError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::PoolNotExists |
            StateError::WorkerNotExists |
            StateError::AllocNotExists |
            StateError::ReplicaNotExists => Self::not_found(&e.to_string()),
            StateError::PoolExists |
            StateError::WorkerExists |
            StateError::AllocExists |
            StateError::WorkerNotEnoughCapacity => Self::conflict(&e.to_string()),
        }
    }
}

impl From<PoolError> for LineAPIError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::State(err) => err.into(),
            PoolError::Encoding(msg) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, &msg),
        }
    }
}

impl From<QueueError> for LineAPIError {
    fn from(e: QueueError) -> Self {
        Self::not_found(&e.to_string())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreatePool {
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub queue: String,
}

impl From<data_model::Pool> for Pool {
    fn from(pool: data_model::Pool) -> Self {
        Self {
            id: pool.id.get().to_string(),
            queue: pool.queue_url,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolList {
    pub pools: Vec<Pool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterWorker {
    pub id: Option<String>,
    pub capacity: i64,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub pool_id: String,
    pub capacity: i64,
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

impl From<data_model::Worker> for Worker {
    fn from(worker: data_model::Worker) -> Self {
        Self {
            id: worker.id.get().to_string(),
            pool_id: worker.pool_id.get().to_string(),
            capacity: worker.capacity,
            queue: worker.queue_url,
            zone: worker.zone,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub allocs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitEval {
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub dataset: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Eval {
    pub id: String,
    pub pool_id: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

impl From<data_model::Eval> for Eval {
    fn from(eval: data_model::Eval) -> Self {
        Self {
            id: eval.id,
            pool_id: eval.pool.get().to_string(),
            size: eval.size,
            dataset: eval.dataset,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Alloc {
    pub id: String,
    pub pool_id: String,
    pub worker_id: String,
    pub eval: Eval,
}

impl From<data_model::Alloc> for Alloc {
    fn from(alloc: data_model::Alloc) -> Self {
        Self {
            id: alloc.id.get().to_string(),
            pool_id: alloc.pool_id.get().to_string(),
            worker_id: alloc.worker_id.get().to_string(),
            eval: alloc.eval.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllocList {
    pub allocs: Vec<Alloc>,
}

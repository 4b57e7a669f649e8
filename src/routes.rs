use std::{sync::Arc, time::Duration};

use axum::{
    extract::{MatchedPath, Path, Request, State},
    http::Method,
    routing::{delete, get, post},
    Json,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{
    config::ServerConfig,
    data_model::{AllocId, AllocNotification, PoolId, WorkerId},
    http_objects::{
        Alloc,
        AllocList,
        CreatePool,
        Eval,
        Heartbeat,
        LineAPIError,
        Pool,
        PoolList,
        RegisterWorker,
        SubmitEval,
        Worker,
    },
    pools::PoolManager,
    queue::QueueManager,
    state_store::LineState,
};

#[derive(Clone)]
pub struct RouteState {
    pub pool_manager: Arc<PoolManager>,
    pub line_state: Arc<LineState>,
    pub queues: Arc<QueueManager>,
    pub config: Arc<ServerConfig>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/pools", post(create_pool).with_state(route_state.clone()))
        .route("/pools", get(list_pools).with_state(route_state.clone()))
        .route(
            "/pools/{pool}",
            get(get_pool).with_state(route_state.clone()),
        )
        .route(
            "/pools/{pool}",
            delete(disband_pool).with_state(route_state.clone()),
        )
        .route(
            "/pools/{pool}/workers",
            post(register_worker).with_state(route_state.clone()),
        )
        .route(
            "/pools/{pool}/workers/{worker}",
            delete(deregister_worker).with_state(route_state.clone()),
        )
        .route(
            "/pools/{pool}/heartbeat",
            post(heartbeat).with_state(route_state.clone()),
        )
        .route(
            "/pools/{pool}/evals",
            post(submit_eval).with_state(route_state.clone()),
        )
        .route(
            "/pools/{pool}/allocs/{alloc}/complete",
            post(complete_alloc).with_state(route_state.clone()),
        )
        .route(
            "/pools/{pool}/workers/{worker}/allocs/receive",
            post(receive_allocs).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn index() -> &'static str {
    "Line Server"
}

#[axum::debug_handler]
async fn create_pool(
    State(state): State<RouteState>,
    Json(payload): Json<CreatePool>,
) -> Result<Json<Pool>, LineAPIError> {
    let pool_id = payload.id.map(|id| PoolId::new(id));
    let pool = state.pool_manager.create_pool(pool_id).await?;
    Ok(Json(pool.into()))
}

async fn list_pools(State(state): State<RouteState>) -> Result<Json<PoolList>, LineAPIError> {
    let pools = state
        .pool_manager
        .list_pools()
        .await
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(PoolList { pools }))
}

async fn get_pool(
    State(state): State<RouteState>,
    Path(pool): Path<String>,
) -> Result<Json<Pool>, LineAPIError> {
    let pool = state.pool_manager.fetch_pool(&PoolId::new(pool)).await?;
    Ok(Json(pool.into()))
}

async fn disband_pool(
    State(state): State<RouteState>,
    Path(pool): Path<String>,
) -> Result<(), LineAPIError> {
    state.pool_manager.disband_pool(&PoolId::new(pool)).await?;
    Ok(())
}

async fn register_worker(
    State(state): State<RouteState>,
    Path(pool): Path<String>,
    Json(payload): Json<RegisterWorker>,
) -> Result<Json<Worker>, LineAPIError> {
    if payload.capacity <= 0 {
        return Err(LineAPIError::bad_request("capacity must be positive"));
    }
    let worker = state
        .pool_manager
        .register_worker(
            &PoolId::new(pool),
            payload.id.map(WorkerId::new),
            payload.capacity,
            payload.zone,
        )
        .await?;
    Ok(Json(worker.into()))
}

async fn deregister_worker(
    State(state): State<RouteState>,
    Path((pool, worker)): Path<(String, String)>,
) -> Result<(), LineAPIError> {
    state
        .pool_manager
        .deregister_worker(&PoolId::new(pool), &WorkerId::new(worker))
        .await?;
    Ok(())
}

async fn heartbeat(
    State(state): State<RouteState>,
    Path(pool): Path<String>,
    Json(payload): Json<Heartbeat>,
) -> Result<(), LineAPIError> {
    let alloc_ids: Vec<AllocId> = payload
        .allocs
        .iter()
        .map(|id| AllocId::new(id.clone()))
        .collect();
    state
        .pool_manager
        .heartbeat(
            &PoolId::new(pool),
            &WorkerId::new(payload.worker_id),
            &payload.datasets,
            &alloc_ids,
        )
        .await?;
    Ok(())
}

async fn submit_eval(
    State(state): State<RouteState>,
    Path(pool): Path<String>,
    Json(payload): Json<SubmitEval>,
) -> Result<Json<Eval>, LineAPIError> {
    if payload.size < 0 {
        return Err(LineAPIError::bad_request("size can't be negative"));
    }
    let eval = state
        .pool_manager
        .submit_eval(&PoolId::new(pool), payload.size, payload.dataset)
        .await?;
    Ok(Json(eval.into()))
}

async fn complete_alloc(
    State(state): State<RouteState>,
    Path((pool, alloc)): Path<(String, String)>,
) -> Result<Json<Alloc>, LineAPIError> {
    let alloc = state
        .pool_manager
        .complete_alloc(&PoolId::new(pool), &AllocId::new(alloc))
        .await?;
    Ok(Json(alloc.into()))
}

/// Long-poll the worker's notification queue and resolve each notification
/// to its allocation. Notifications whose allocation was reclaimed in the
/// meantime are dropped.
async fn receive_allocs(
    State(state): State<RouteState>,
    Path((pool, worker)): Path<(String, String)>,
) -> Result<Json<AllocList>, LineAPIError> {
    let pool_id = PoolId::new(pool);
    let worker_id = WorkerId::new(worker);
    let worker = state.line_state.get_worker(&pool_id, &worker_id).await?;

    let messages = state
        .queues
        .receive(
            &worker.queue_url,
            state.config.queue_batch_size,
            Duration::from_secs(state.config.queue_wait_time_secs),
            Duration::from_secs(state.config.notification_visibility_secs),
        )
        .await?;

    let mut allocs = Vec::new();
    for message in messages {
        match serde_json::from_str::<AllocNotification>(&message.body) {
            Ok(notification) => {
                if let Ok(alloc) = state
                    .line_state
                    .get_alloc(&pool_id, &notification.alloc_id)
                    .await
                {
                    allocs.push(alloc.into());
                }
            }
            Err(err) => {
                warn!("dropping undecodable alloc notification: {err:?}");
            }
        }
        let _ = state
            .queues
            .delete_message(&worker.queue_url, &message.receipt_handle)
            .await;
    }
    Ok(Json(AllocList { allocs }))
}

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flintio_core::{create_store, ChunkId, ChunkOptions, ChunkRegistry, Config, FlintError, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

mod types;
use types::*;

pub struct ServerState {
    pub(crate) registry: Arc<ChunkRegistry>,
    pub(crate) node_id: String,
}

pub async fn run_server(config: Config) -> Result<()> {
    let store = create_store(&config.store.uri)?;
    let registry = Arc::new(ChunkRegistry::new(store, config.chunk.pending_timeout()));

    // Reconstruct previously stored chunks before accepting traffic.
    registry.load().await?;

    let state = Arc::new(ServerState {
        registry,
        node_id: config.node.node_id.clone(),
    });

    let app = router(state);

    let listener = TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!("Flintio listening on {}", config.node.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| FlintError::Internal(error.to_string()))?;

    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/chunks", post(create_chunk).get(list_chunks))
        .route("/api/v1/chunks/:id", get(stat_chunk).delete(remove_chunk))
        .route("/api/v1/chunks/:id/append", axum::routing::put(append_chunk))
        .route("/api/v1/chunks/:id/read", get(read_chunk))
        .route("/api/v1/chunks/:id/seal", post(seal_chunk))
        .with_state(state)
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.node_id.clone(),
    })
}

async fn create_chunk(
    State(state): State<Arc<ServerState>>,
    request: Option<Json<CreateChunkRequest>>,
) -> impl IntoResponse {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let options = ChunkOptions {
        append_out_of_order: request.append_out_of_order,
        digest: request.digest,
    };

    match state.registry.create_chunk(options).await {
        Ok(chunk) => (
            StatusCode::CREATED,
            Json(CreateChunkResponse {
                id: chunk.id().to_string(),
            }),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

async fn list_chunks(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let start = match &query.start {
        Some(raw) => match raw.parse::<ChunkId>() {
            Ok(id) => id,
            Err(error) => return error_response(error),
        },
        None => ChunkId::zero(),
    };

    let mut ids = Vec::new();
    state
        .registry
        .list_chunk(start, query.limit, |id| {
            ids.push(id.to_string());
            Ok(())
        })
        .await;

    (StatusCode::OK, Json(ListChunksResponse { ids })).into_response()
}

async fn stat_chunk(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let chunk = match lookup(&state, &id).await {
        Ok(chunk) => chunk,
        Err(error) => return error_response(error),
    };

    let stat = chunk.stat().await;
    (
        StatusCode::OK,
        Json(StatChunkResponse {
            id: chunk.id().to_string(),
            size: stat.size,
            state: stat.state,
            append_out_of_order: stat.options.append_out_of_order,
            digest: stat.options.digest,
        }),
    )
        .into_response()
}

async fn append_chunk(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<AppendQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let chunk = match lookup(&state, &id).await {
        Ok(chunk) => chunk,
        Err(error) => return error_response(error),
    };

    match chunk.append(body, query.offset).await {
        Ok(offset) => (StatusCode::OK, Json(AppendChunkResponse { offset })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn read_chunk(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> impl IntoResponse {
    let chunk = match lookup(&state, &id).await {
        Ok(chunk) => chunk,
        Err(error) => return error_response(error),
    };

    match chunk.read(query.offset, query.length).await {
        Ok(bytes) => {
            let mut response = Response::new(bytes.into());
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(error) => error_response(error),
    }
}

async fn seal_chunk(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let chunk = match lookup(&state, &id).await {
        Ok(chunk) => chunk,
        Err(error) => return error_response(error),
    };

    match chunk.seal().await {
        Ok(length) => (StatusCode::OK, Json(SealChunkResponse { length })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn remove_chunk(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match id.parse::<ChunkId>() {
        Ok(id) => id,
        Err(error) => return error_response(error),
    };

    match state.registry.remove_chunk(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(RemoveChunkResponse { removed: true }),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

async fn lookup(state: &ServerState, id: &str) -> Result<Arc<flintio_core::Chunk>> {
    let id = id.parse::<ChunkId>()?;
    state.registry.get_chunk(id).await
}

fn error_response(error: FlintError) -> Response {
    let status = match &error {
        FlintError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        FlintError::NotFound(_) => StatusCode::NOT_FOUND,
        FlintError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        FlintError::AlreadyExists(_) => StatusCode::CONFLICT,
        FlintError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {}", error);
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

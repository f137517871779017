use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: String,
    pub(crate) node_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CreateChunkRequest {
    #[serde(default)]
    pub(crate) append_out_of_order: bool,
    #[serde(default)]
    pub(crate) digest: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateChunkResponse {
    pub(crate) id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    pub(crate) start: Option<String>,
    #[serde(default = "default_limit")]
    pub(crate) limit: u32,
}

fn default_limit() -> u32 {
    1000
}

#[derive(Debug, Serialize)]
pub(crate) struct ListChunksResponse {
    pub(crate) ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatChunkResponse {
    pub(crate) id: String,
    pub(crate) size: u64,
    pub(crate) state: flintio_core::ChunkState,
    pub(crate) append_out_of_order: bool,
    pub(crate) digest: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AppendQuery {
    pub(crate) offset: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct AppendChunkResponse {
    /// Committed size after this append, i.e. the next append offset.
    pub(crate) offset: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadQuery {
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct SealChunkResponse {
    pub(crate) length: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct RemoveChunkResponse {
    pub(crate) removed: bool,
}

use serde::Deserialize;
use serde::Serialize;

use crate::score::ScoreEntry;

/// Uniform envelope for command endpoints.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddPgidRequest {
    pub pgid: i32,
    pub jobid: i32,
    pub worker_num: i32,
}

#[derive(Debug, Deserialize)]
pub struct RemovePgidRequest {
    pub pgid: i32,
}

#[derive(Debug, Deserialize)]
pub struct ThresholdRequest {
    pub seconds: i32,
}

#[derive(Debug, Deserialize)]
pub struct AgentEndpointRequest {
    pub id: i32,
}

#[derive(Debug, Deserialize)]
pub struct ProfileRequest {
    pub pid: i32,
}

#[derive(Debug, Deserialize)]
pub struct ScoreUpdateRequest {
    pub jobid1: i32,
    pub jobid2: i32,
    pub score: f64,
}

#[derive(Debug, Deserialize)]
pub struct BaselineUpdateRequest {
    pub jobid: i32,
    pub ipc: f64,
}

#[derive(Debug, Serialize)]
pub struct ScoreDumpResponse {
    pub success: bool,
    pub entries: Vec<ScoreEntry>,
}

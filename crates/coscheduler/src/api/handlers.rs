use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use ipc_monitor::IpcMonitor;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use tracing::info;

use crate::agent::AgentChannel;
use crate::lifecycle::LifecycleController;
use crate::score::ScoreBook;

use super::errors::ControlError;
use super::types::*;

#[handler]
pub async fn ping() -> &'static str {
    "ok"
}

#[handler]
pub async fn reset_counters(engine: Data<&Arc<IpcMonitor>>) -> Json<CommandResponse> {
    engine.reset_all();
    info!("counters reset via control surface");
    Json(CommandResponse::ok("counters reset"))
}

#[handler]
pub async fn add_pgid(
    request: Json<AddPgidRequest>,
    lifecycle: Data<&Arc<LifecycleController>>,
) -> poem::Result<Json<CommandResponse>> {
    if request.pgid <= 0 {
        return Err(ControlError::InvalidArg("pgid must be positive").into());
    }
    if request.worker_num <= 0 {
        return Err(ControlError::InvalidArg("worker_num must be positive").into());
    }

    lifecycle
        .add_tracked(request.pgid, request.jobid, request.worker_num)
        .map_err(ControlError::from)?;
    Ok(Json(CommandResponse::ok(format!(
        "tracking pgid {}",
        request.pgid
    ))))
}

#[handler]
pub async fn remove_pgid(
    request: Json<RemovePgidRequest>,
    lifecycle: Data<&Arc<LifecycleController>>,
) -> poem::Result<Json<CommandResponse>> {
    if request.pgid <= 0 {
        return Err(ControlError::InvalidArg("pgid must be positive").into());
    }

    lifecycle
        .remove_tracked(request.pgid)
        .map_err(ControlError::from)?;
    Ok(Json(CommandResponse::ok(format!(
        "stopped tracking pgid {}",
        request.pgid
    ))))
}

#[handler]
pub async fn set_threshold(
    request: Json<ThresholdRequest>,
    lifecycle: Data<&Arc<LifecycleController>>,
) -> poem::Result<Json<CommandResponse>> {
    if request.seconds <= 0 {
        return Err(ControlError::InvalidArg("threshold must be positive").into());
    }

    lifecycle.set_threshold(Duration::from_secs(request.seconds as u64));
    Ok(Json(CommandResponse::ok(format!(
        "threshold set to {} s",
        request.seconds
    ))))
}

#[handler]
pub async fn set_agent_endpoint(
    request: Json<AgentEndpointRequest>,
    agent: Data<&Arc<AgentChannel>>,
) -> poem::Result<Json<CommandResponse>> {
    if request.id < 0 {
        return Err(ControlError::InvalidArg("agent endpoint must be non-negative").into());
    }

    agent.set_endpoint(request.id);
    Ok(Json(CommandResponse::ok(format!(
        "agent endpoint set to {}",
        request.id
    ))))
}

#[handler]
pub async fn request_profile(
    request: Json<ProfileRequest>,
    lifecycle: Data<&Arc<LifecycleController>>,
) -> poem::Result<Json<CommandResponse>> {
    if request.pid <= 0 {
        return Err(ControlError::InvalidArg("pid must be positive").into());
    }

    let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(request.pid)))
        .map_err(|_| ControlError::NoSuchProcess(request.pid))?;
    lifecycle
        .request_profile_for(pgid.as_raw())
        .map_err(ControlError::from)?;
    Ok(Json(CommandResponse::ok(format!(
        "profile request queued for pgid {pgid}"
    ))))
}

#[handler]
pub async fn update_score(
    request: Json<ScoreUpdateRequest>,
    book: Data<&Arc<RwLock<ScoreBook>>>,
) -> poem::Result<Json<CommandResponse>> {
    if !request.score.is_finite() {
        return Err(ControlError::InvalidArg("score must be finite").into());
    }

    book.write()
        .expect("poisoned")
        .update_score(request.jobid1, request.jobid2, request.score);
    Ok(Json(CommandResponse::ok(format!(
        "score({}, {}) updated",
        request.jobid1, request.jobid2
    ))))
}

#[handler]
pub async fn update_baseline(
    request: Json<BaselineUpdateRequest>,
    book: Data<&Arc<RwLock<ScoreBook>>>,
) -> poem::Result<Json<CommandResponse>> {
    if !request.ipc.is_finite() || request.ipc < 0.0 {
        return Err(ControlError::InvalidArg("baseline ipc must be finite and non-negative").into());
    }

    book.write()
        .expect("poisoned")
        .update_baseline(request.jobid, request.ipc);
    Ok(Json(CommandResponse::ok(format!(
        "baseline({}) updated",
        request.jobid
    ))))
}

#[handler]
pub async fn dump_scores(book: Data<&Arc<RwLock<ScoreBook>>>) -> Json<ScoreDumpResponse> {
    let entries = book.read().expect("poisoned").entries();
    Json(ScoreDumpResponse {
        success: true,
        entries,
    })
}

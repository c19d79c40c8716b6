//! Operator API handlers
//!
//! Every endpoint answers HTTP 200 with a `{code, message, data}` envelope;
//! failures are told apart by `code`.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use super::dto::{AddSessionRequest, ChannelParams, DeviceParams, ResultCommon, RouteResponse};
use crate::application::{DeviceService, InviteMode};
use crate::domain::{codes, Device, GatewayError};

const ADD_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub service: DeviceService,
}

impl AppState {
    pub fn new(service: DeviceService) -> Self {
        Self { service }
    }
}

/// `GET /getSession?ids=a&ids=b` (or `ids=a,b`); no ids dumps every session.
pub async fn get_session(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Json<ResultCommon> {
    let ids: Vec<String> = pairs
        .into_iter()
        .filter(|(k, _)| k == "ids")
        .flat_map(|(_, v)| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();

    let sessions = state.service.sessions();
    let mut result = BTreeMap::new();
    if ids.is_empty() {
        for device in sessions.devices() {
            if device.is_valid() {
                result.insert(device.device_id.clone(), device.snapshot().await);
            }
        }
    } else {
        for id in ids {
            if let Some(device) = sessions.get(&id).await {
                result.insert(id, device.snapshot().await);
            }
        }
    }
    Json(ResultCommon::success(result))
}

/// `POST /addSession`: store or overwrite a session directly.
pub async fn add_session(
    State(state): State<AppState>,
    body: Result<Json<AddSessionRequest>, JsonRejection>,
) -> Json<ResultCommon> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(e) => {
            warn!("API: Invalid addSession body: {}", e);
            return Json(ResultCommon::fail(codes::PARAMETER, e.body_text()));
        }
    };

    let ttl = request.expires.map(Duration::from_secs).unwrap_or(ADD_SESSION_TTL);
    let mut device = Device::new(request.device_id.as_str(), request.from, request.addr, ttl);
    if let Some(cseq) = request.cseq {
        device = device.with_cseq(cseq);
    }

    match state.service.sessions().store(device, ttl).await {
        Ok(device) => {
            info!(device_id = %device.device_id, "API: Session added");
            Json(ResultCommon::success(true))
        }
        Err(e) => Json(ResultCommon::from_error(&e, codes::PARAMETER)),
    }
}

async fn invite_with(state: AppState, params: ChannelParams, mode: InviteMode) -> Json<ResultCommon> {
    if let Err(e) = params.validate() {
        return Json(ResultCommon::from_error(&e, codes::PARAMETER));
    }
    let (start, end) = params.range();

    info!(device_id = %params.id, channel_id = %params.channel, start, end, "API: Invite");
    match state
        .service
        .invite(&params.id, &params.channel, start, end, mode)
        .await
    {
        Ok(stream_path) => Json(ResultCommon::success(stream_path)),
        Err(GatewayError::AlreadyInvited(_)) => {
            let mut result = ResultCommon::success("invited");
            result.message = "already invited".to_string();
            Json(result)
        }
        Err(e) => Json(ResultCommon::from_error(&e, codes::INVITE_FAILED)),
    }
}

/// `POST /invite`
pub async fn invite(
    State(state): State<AppState>,
    Query(params): Query<ChannelParams>,
) -> Json<ResultCommon> {
    invite_with(state, params, InviteMode::Guarded).await
}

/// `POST /inviteWithoutBye`
pub async fn invite_without_bye(
    State(state): State<AppState>,
    Query(params): Query<ChannelParams>,
) -> Json<ResultCommon> {
    invite_with(state, params, InviteMode::Unguarded).await
}

fn bye_result(result: Result<(), GatewayError>) -> Json<ResultCommon> {
    match result {
        Ok(()) => Json(ResultCommon::success("success")),
        Err(e) => Json(ResultCommon::from_error(&e, codes::BYE_FAILED)),
    }
}

/// `POST /bye`
pub async fn bye(
    State(state): State<AppState>,
    Query(params): Query<ChannelParams>,
) -> Json<ResultCommon> {
    if let Err(e) = params.validate() {
        return Json(ResultCommon::from_error(&e, codes::PARAMETER));
    }
    bye_result(state.service.bye(&params.id, &params.channel).await)
}

/// `POST /bye2`
pub async fn bye2(
    State(state): State<AppState>,
    Query(params): Query<ChannelParams>,
) -> Json<ResultCommon> {
    if let Err(e) = params.validate() {
        return Json(ResultCommon::from_error(&e, codes::PARAMETER));
    }
    bye_result(state.service.bye2(&params.id, &params.channel).await)
}

/// `POST /query`: on-demand catalog refresh
pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<DeviceParams>,
) -> Json<ResultCommon> {
    if params.id.trim().is_empty() {
        return Json(ResultCommon::fail(codes::PARAMETER, "id is null"));
    }
    match state.service.query_device(&params.id).await {
        Ok(()) => Json(ResultCommon::success("success")),
        Err(e) => Json(ResultCommon::from_error(&e, codes::QUERY_FAILED)),
    }
}

/// `GET /route?id=..`: which instance owns a device
pub async fn route(
    State(state): State<AppState>,
    Query(params): Query<DeviceParams>,
) -> Json<ResultCommon> {
    if params.id.trim().is_empty() {
        return Json(ResultCommon::fail(codes::PARAMETER, "id is null"));
    }
    let router = state.service.sessions().router();
    let owner = router.get_route(&params.id).await;
    let local = owner.as_deref() == Some(router.instance_addr());
    Json(ResultCommon::success(RouteResponse {
        device_id: params.id,
        owner,
        local,
    }))
}

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> Json<ResultCommon> {
    Json(ResultCommon::success(serde_json::json!({
        "status": "ok",
        "sessions": state.service.sessions().len(),
    })))
}

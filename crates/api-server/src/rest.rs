//! REST handlers for the campaign control surface.
//!
//! Disallowed lifecycle transitions come back as client errors with an
//! explanatory message and unchanged state, never a crash.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use outreach_audience::AudienceResolver;
use outreach_core::store::Store;
use outreach_core::types::*;
use outreach_core::OutreachError;
use outreach_dispatch::{
    CampaignEngine, CampaignStatistics, CreateCampaignRequest, DeliveryTracker,
    UpdateCampaignRequest,
};
use outreach_sequence::SequenceRunner;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Shared application state for REST and webhook handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub engine: Arc<CampaignEngine>,
    pub resolver: Arc<AudienceResolver>,
    pub runner: Arc<SequenceRunner>,
    pub tracker: Arc<DeliveryTracker>,
    pub event_sink: Arc<dyn outreach_core::event_bus::EventSink>,
    pub default_session: String,
    pub start_time: Instant,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: OutreachError) -> ApiError {
    let (status, code) = match &err {
        OutreachError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        OutreachError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
        OutreachError::Transition(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition"),
        OutreachError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: err.to_string(),
        }),
    )
}

// ─── Campaigns ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CampaignDetail {
    pub campaign: Campaign,
    pub statistics: CampaignStatistics,
}

#[derive(Deserialize, Default)]
pub struct SessionRequest {
    #[serde(default)]
    pub session: Option<String>,
}

impl SessionRequest {
    fn resolve(&self, state: &AppState) -> String {
        self.session
            .clone()
            .unwrap_or_else(|| state.default_session.clone())
    }
}

pub async fn list_campaigns(State(state): State<AppState>) -> Json<Vec<Campaign>> {
    Json(state.engine.list())
}

pub async fn create_campaign(
    State(state): State<AppState>,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = state.engine.create(req).map_err(api_error)?;
    metrics::counter!("api.campaigns_created").increment(1);
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignDetail>, ApiError> {
    let campaign = state.engine.get(&id).map_err(api_error)?;
    let statistics = state.engine.statistics(&id).map_err(api_error)?;
    Ok(Json(CampaignDetail {
        campaign,
        statistics,
    }))
}

pub async fn update_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCampaignRequest>,
) -> Result<Json<Campaign>, ApiError> {
    state.engine.update(&id, req).map(Json).map_err(api_error)
}

pub async fn delete_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete(&id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<Campaign>, ApiError> {
    let session = req.resolve(&state);
    state
        .engine
        .start(&id, &session)
        .map(Json)
        .map_err(api_error)
}

pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    state.engine.pause(&id).map(Json).map_err(api_error)
}

pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<Campaign>, ApiError> {
    let session = req.resolve(&state);
    state
        .engine
        .resume(&id, &session)
        .map(Json)
        .map_err(api_error)
}

// ─── Segments ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSegmentRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub criteria: Vec<Criterion>,
}

#[derive(Deserialize)]
pub struct PreviewRequest {
    pub criteria: Vec<Criterion>,
}

#[derive(Serialize)]
pub struct PreviewResponse {
    pub count: u64,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub contact_count: u64,
}

pub async fn list_segments(State(state): State<AppState>) -> Json<Vec<Segment>> {
    Json(state.store.segments.list())
}

pub async fn create_segment(
    State(state): State<AppState>,
    Json(req): Json<CreateSegmentRequest>,
) -> Result<(StatusCode, Json<Segment>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(api_error(OutreachError::Validation(
            "segment name is required".into(),
        )));
    }
    let now = Utc::now();
    let segment = Segment {
        id: Uuid::new_v4(),
        name: req.name,
        description: req.description,
        criteria: req.criteria,
        contact_count: 0,
        created_at: now,
        updated_at: now,
    };
    let id = segment.id;
    state.store.segments.insert(segment);
    // New segments sync immediately so the membership cache is never cold.
    state.resolver.sync(&id).map_err(api_error)?;
    let segment = state
        .store
        .segments
        .get(&id)
        .ok_or_else(|| api_error(OutreachError::NotFound(format!("Segment {id}"))))?;
    Ok((StatusCode::CREATED, Json(segment)))
}

pub async fn get_segment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Segment>, ApiError> {
    state
        .store
        .segments
        .get(&id)
        .map(Json)
        .ok_or_else(|| api_error(OutreachError::NotFound(format!("Segment {id}"))))
}

/// Preview how many contacts a criteria set reaches, without saving.
pub async fn preview_segment(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> Json<PreviewResponse> {
    Json(PreviewResponse {
        count: state.resolver.count(&req.criteria),
    })
}

pub async fn sync_segment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncResponse>, ApiError> {
    let contact_count = state.resolver.sync(&id).map_err(api_error)?;
    Ok(Json(SyncResponse { contact_count }))
}

// ─── Sequences ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSequenceRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<SequenceStep>,
}

#[derive(Deserialize)]
pub struct EnrollRequest {
    pub contact_id: Uuid,
    #[serde(default)]
    pub session: Option<String>,
}

pub async fn create_sequence(
    State(state): State<AppState>,
    Json(req): Json<CreateSequenceRequest>,
) -> Result<(StatusCode, Json<FollowUpSequence>), ApiError> {
    if req.steps.is_empty() {
        return Err(api_error(OutreachError::Validation(
            "sequence needs at least one step".into(),
        )));
    }
    let now = Utc::now();
    let sequence = FollowUpSequence {
        id: Uuid::new_v4(),
        name: req.name,
        description: req.description,
        steps: req.steps,
        created_at: now,
        updated_at: now,
    };
    state.store.sequences.insert_sequence(sequence.clone());
    Ok((StatusCode::CREATED, Json(sequence)))
}

pub async fn enroll_contact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<ContactSequence>), ApiError> {
    let session = req
        .session
        .clone()
        .unwrap_or_else(|| state.default_session.clone());
    let cs = state
        .runner
        .enroll(&req.contact_id, &id, &session)
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(cs)))
}

// ─── Sessions ──────────────────────────────────────────────────────────────

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<ChannelSession>> {
    Json(state.store.sessions.list())
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ChannelSession>, ApiError> {
    state
        .store
        .sessions
        .get(&name)
        .map(Json)
        .ok_or_else(|| api_error(OutreachError::NotFound(format!("Session {name}"))))
}

// ─── Probes ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// GET /health — Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /live — Liveness probe for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

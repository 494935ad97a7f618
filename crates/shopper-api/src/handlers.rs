use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shopper_domain::{
    ApiEndpoint, CreateSessionRequest, GpuOffer, OfferFilter, Session, SessionId, SessionStatus,
};

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.list_sessions().await?;
    Ok(StatusCode::OK)
}

// ── Status ────────────────────────────────────────────────────────────────────

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let sessions = state.store.list_sessions().await?;
    let mut by_status: HashMap<String, usize> = HashMap::new();
    for s in &sessions {
        *by_status.entry(s.status.to_string()).or_default() += 1;
    }

    Ok(Json(json!({
        "session_count": sessions.len(),
        "by_status": by_status,
        "providers": state.registry.names(),
        "reconciler": state.reconciler_metrics.snapshot(),
    })))
}

// ── Inventory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InventoryQuery {
    pub provider: Option<String>,
    pub gpu_type: Option<String>,
    pub max_price: Option<f64>,
    pub min_vram: Option<u32>,
    pub min_gpu_count: Option<u32>,
}

pub async fn list_inventory(
    State(state): State<AppState>,
    Query(q): Query<InventoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = OfferFilter {
        provider: q.provider.clone(),
        gpu_type: q.gpu_type,
        max_price_per_hour: q.max_price,
        min_vram_gb: q.min_vram,
        min_gpu_count: q.min_gpu_count,
        ..Default::default()
    };

    let mut offers: Vec<GpuOffer> = Vec::new();
    let mut provider_errors: Vec<String> = Vec::new();
    for provider in state.registry.all() {
        if let Some(wanted) = &q.provider {
            if provider.name() != wanted {
                continue;
            }
        }
        match provider.list_offers(&filter).await {
            Ok(batch) => offers.extend(batch),
            Err(e) => {
                if e.is_rate_limit() {
                    return Err(e.into());
                }
                provider_errors.push(format!("{}: {}", provider.name(), e));
            }
        }
    }
    offers.sort_by(|a, b| {
        a.price_per_hour
            .partial_cmp(&b.price_per_hour)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(Json(json!({ "offers": offers, "errors": provider_errors })))
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Wire form of a session. The SSH private key is never part of this type;
/// it only appears in the one-time create response.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub consumer_id: String,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub provider: String,
    pub provider_instance_id: String,
    pub offer_id: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub price_per_hour: f64,
    pub workload_type: Option<String>,
    pub reservation_hours: u32,
    pub idle_threshold_minutes: Option<u32>,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub api_endpoint: Option<ApiEndpoint>,
    pub auto_retry: bool,
    pub max_retries: u32,
    pub retry_count: u32,
    pub retry_parent_id: Option<String>,
    pub retry_child_id: Option<String>,
    /// Comma-joined failed offer ids.
    pub failed_offers: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl From<Session> for SessionResponse {
    fn from(s: Session) -> Self {
        SessionResponse {
            id: s.id.to_string(),
            consumer_id: s.consumer_id.clone(),
            status: s.status,
            error: s.error.clone(),
            provider: s.provider.clone(),
            provider_instance_id: s.provider_instance_id.clone(),
            offer_id: s.offer_id.to_string(),
            gpu_type: s.gpu_type.clone(),
            gpu_count: s.gpu_count,
            price_per_hour: s.price_per_hour,
            workload_type: s.workload_type.clone(),
            reservation_hours: s.reservation_hours,
            idle_threshold_minutes: s.idle_threshold_minutes,
            ssh_host: s.ssh_host.clone(),
            ssh_port: s.ssh_port,
            ssh_user: s.ssh_user.clone(),
            api_endpoint: s.api_endpoint.clone(),
            auto_retry: s.auto_retry,
            max_retries: s.max_retries,
            retry_count: s.retry_count,
            retry_parent_id: s.retry_parent_id.as_ref().map(|p| p.to_string()),
            retry_child_id: s.retry_child_id.as_ref().map(|c| c.to_string()),
            failed_offers: s.failed_offers_csv(),
            created_at: s.created_at,
            expires_at: s.expires_at,
            stopped_at: s.stopped_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub consumer_id: Option<String>,
    pub status: Option<String>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(q): Query<SessionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let status_filter = match q.status.as_deref() {
        Some(s) => Some(
            s.parse::<SessionStatus>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
        ),
        None => None,
    };

    let sessions: Vec<SessionResponse> = state
        .store
        .list_sessions()
        .await?
        .into_iter()
        .filter(|s| q.consumer_id.as_deref().map_or(true, |c| s.consumer_id == c))
        .filter(|s| status_filter.map_or(true, |f| s.status == f))
        .map(SessionResponse::from)
        .collect();

    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let created = state.engine.create_session(req).await?;
    let body = json!({
        "session": SessionResponse::from(created.session),
        "ssh_private_key": created.ssh_private_key,
    });
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .store
        .get(&SessionId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session '{}' not found", id)))?;
    Ok(Json(SessionResponse::from(session)))
}

pub async fn destroy_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.engine.force_destroy(&SessionId::new(&id)).await?;
    Ok(Json(SessionResponse::from(session)))
}

pub async fn signal_done(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.engine.signal_done(&SessionId::new(&id)).await?;
    Ok(Json(SessionResponse::from(session)))
}

#[derive(Debug, Deserialize)]
pub struct ExtendBody {
    pub additional_hours: u32,
}

pub async fn extend_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExtendBody>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .engine
        .extend_session(&SessionId::new(&id), body.additional_hours)
        .await?;
    Ok(Json(SessionResponse::from(session)))
}

// ── Costs ─────────────────────────────────────────────────────────────────────

fn session_cost(session: &Session, now: DateTime<Utc>) -> f64 {
    let end = session.stopped_at.unwrap_or(now);
    let hours = (end - session.created_at).num_seconds().max(0) as f64 / 3600.0;
    session.price_per_hour * hours
}

pub async fn list_costs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let rows: Vec<Value> = state
        .store
        .list_sessions()
        .await?
        .iter()
        .map(|s| {
            json!({
                "session_id": s.id,
                "consumer_id": s.consumer_id,
                "provider": s.provider,
                "gpu_type": s.gpu_type,
                "status": s.status,
                "price_per_hour": s.price_per_hour,
                "cost_usd": session_cost(s, now),
            })
        })
        .collect();
    Ok(Json(json!({ "costs": rows })))
}

pub async fn cost_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let sessions = state.store.list_sessions().await?;

    let mut by_provider: HashMap<String, f64> = HashMap::new();
    let mut by_status: HashMap<String, f64> = HashMap::new();
    let mut total = 0.0;
    for s in &sessions {
        let cost = session_cost(s, now);
        *by_provider.entry(s.provider.clone()).or_default() += cost;
        *by_status.entry(s.status.to_string()).or_default() += cost;
        total += cost;
    }

    Ok(Json(json!({
        "total_usd": total,
        "by_provider": by_provider,
        "by_status": by_status,
        "session_count": sessions.len(),
    })))
}

//! JSON API over the dashboard service.
//!
//! Every response uses the same envelope: `{"success": true, "data": ...}` or
//! `{"success": false, "error": "..."}`.

use anyhow::Context;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::Error;
use crate::model::{
    MoistureReading, NewSchedule, Schedule, ScheduleId, WateringEvent, Zone, ZoneId,
};
use crate::runner::Activation;
use crate::service::{Dashboard, SensorReading, Service, ZoneToggle};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

type ApiResult<T> = Result<Json<Envelope<T>>, Error>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    }))
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidScheduleTime { .. } | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("web: request failed: {self}");
        }
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Error> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| Error::invalid_input(rejection.body_text()))
}

fn path<T>(param: Result<Path<T>, PathRejection>) -> Result<T, Error> {
    param
        .map(|Path(v)| v)
        .map_err(|rejection| Error::invalid_input(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, Error> {
    params
        .map(|Query(v)| v)
        .map_err(|rejection| Error::invalid_input(rejection.body_text()))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<S: Store>(service: Service<S>) -> Router {
    Router::new()
        .route("/api/status", get(api_status::<S>))
        .route("/api/sensors", get(api_sensors::<S>).post(api_update_sensor::<S>))
        .route("/api/zones/{id}/toggle", post(api_toggle_zone::<S>))
        .route("/api/zones/{id}/water", post(api_water_zone::<S>))
        .route("/api/zones/{id}/stop", post(api_stop_zone::<S>))
        .route(
            "/api/schedules",
            get(api_schedules::<S>).post(api_create_schedule::<S>),
        )
        .route("/api/schedules/{id}/toggle", post(api_toggle_schedule::<S>))
        .route("/api/schedules/{id}", delete(api_delete_schedule::<S>))
        .route("/api/events", get(api_events::<S>))
        .route("/api/history", get(api_history::<S>))
        .with_state(service)
}

async fn api_status<S: Store>(State(svc): State<Service<S>>) -> ApiResult<Dashboard> {
    let now = svc.now();
    ok(svc.dashboard(now).await?)
}

async fn api_sensors<S: Store>(State(svc): State<Service<S>>) -> ApiResult<Vec<SensorReading>> {
    ok(svc.sensors().await?)
}

#[derive(Debug, Deserialize)]
struct SensorUpdate {
    zone_id: ZoneId,
    moisture: u8,
}

async fn api_update_sensor<S: Store>(
    State(svc): State<Service<S>>,
    payload: Result<Json<SensorUpdate>, JsonRejection>,
) -> ApiResult<Zone> {
    let update = body(payload)?;
    ok(svc.update_moisture(update.zone_id, update.moisture).await?)
}

async fn api_toggle_zone<S: Store>(
    State(svc): State<Service<S>>,
    id: Result<Path<ZoneId>, PathRejection>,
) -> ApiResult<ZoneToggle> {
    let id = path(id)?;
    ok(svc.toggle_zone(id).await?)
}

async fn api_water_zone<S: Store>(
    State(svc): State<Service<S>>,
    id: Result<Path<ZoneId>, PathRejection>,
) -> ApiResult<Activation> {
    let id = path(id)?;
    ok(svc.water_zone_now(id).await?)
}

async fn api_stop_zone<S: Store>(
    State(svc): State<Service<S>>,
    id: Result<Path<ZoneId>, PathRejection>,
) -> ApiResult<Option<WateringEvent>> {
    let id = path(id)?;
    ok(svc.stop_zone(id).await?)
}

async fn api_schedules<S: Store>(State(svc): State<Service<S>>) -> ApiResult<Vec<Schedule>> {
    ok(svc.list_schedules().await?)
}

async fn api_create_schedule<S: Store>(
    State(svc): State<Service<S>>,
    payload: Result<Json<NewSchedule>, JsonRejection>,
) -> ApiResult<Schedule> {
    let new = body(payload)?;
    ok(svc.create_schedule(new).await?)
}

async fn api_toggle_schedule<S: Store>(
    State(svc): State<Service<S>>,
    id: Result<Path<ScheduleId>, PathRejection>,
) -> ApiResult<Schedule> {
    let id = path(id)?;
    ok(svc.toggle_schedule(id).await?)
}

async fn api_delete_schedule<S: Store>(
    State(svc): State<Service<S>>,
    id: Result<Path<ScheduleId>, PathRejection>,
) -> ApiResult<()> {
    let id = path(id)?;
    ok(svc.delete_schedule(id).await?)
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    zone: Option<ZoneId>,
}

async fn api_events<S: Store>(
    State(svc): State<Service<S>>,
    q: Result<Query<EventsQuery>, QueryRejection>,
) -> ApiResult<Vec<WateringEvent>> {
    let q = query(q)?;
    ok(svc.events(q.zone).await?)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    zone: Option<ZoneId>,
    limit: Option<usize>,
}

async fn api_history<S: Store>(
    State(svc): State<Service<S>>,
    q: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Vec<MoistureReading>> {
    let q = query(q)?;
    ok(svc.history(q.zone, q.limit).await?)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<S: Store>(service: Service<S>) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(service))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

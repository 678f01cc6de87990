//! HTTP Handlers

use std::net::{IpAddr, SocketAddr};

use axum::extract::{Path, Query, State};
use axum::{Form, Json};
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::bacnet::{IAm, ObjectIdentifier, PropertyIdentifier, PropertyReference, PropertyValue, WhoIs};
use crate::occupancy::evaluate;
use crate::schedule::{Day, DayWindow, ScheduleOrigin};

use super::auth::{AuthUser, expired_cookie, session_cookie, session_token};
use super::error::ApiError;
use super::state::AppState;

fn redirect(location: &'static str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location)]).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Public
// ─────────────────────────────────────────────────────────────────────────────

pub async fn index(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let user = session_token(&headers).and_then(|token| state.session_user(token));
    Json(json!({
        "name": state.device().identity().name,
        "version": env!("CARGO_PKG_VERSION"),
        "logged_in": user.is_some(),
        "user": user,
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let services: Vec<Value> = state
        .service_manager()
        .list()
        .into_iter()
        .map(|(id, service_state)| json!({ "id": id, "state": service_state.to_string() }))
        .collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "services": services,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

pub async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Result<Response, ApiError> {
    if !state.authenticate(&form.username, &form.password) {
        info!("Failed login for {}", form.username);
        return Err(ApiError::BadCredentials);
    }
    let token = state.create_session(&form.username);
    info!("{} logged in", form.username);
    Ok((
        StatusCode::FOUND,
        [(LOCATION, "/".to_string()), (SET_COOKIE, session_cookie(token))],
    )
        .into_response())
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.end_session(token);
    }
    (
        StatusCode::FOUND,
        [(LOCATION, "/".to_string()), (SET_COOKIE, expired_cookie())],
    )
        .into_response()
}

/// Form login for API clients, answering with a bearer token
pub async fn token(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Result<Json<Value>, ApiError> {
    if !state.authenticate(&form.username, &form.password) {
        return Err(ApiError::BadCredentials);
    }
    let token = state.create_session(&form.username);
    Ok(Json(json!({ "access_token": token, "token_type": "bearer" })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Schedule
// ─────────────────────────────────────────────────────────────────────────────

pub async fn schedule(State(state): State<AppState>, user: AuthUser) -> Json<Value> {
    let store = state.schedule();
    Json(json!({
        "user": user.username,
        "schedule": store.snapshot(),
        "from_defaults": store.origin() == ScheduleOrigin::Defaults,
    }))
}

pub async fn manage_schedule_page(State(state): State<AppState>, _user: AuthUser) -> Json<Value> {
    let days: Vec<&str> = Day::ALL.iter().map(|day| day.name()).collect();
    let time_slots: Vec<String> = (0..24).map(|hour| format!("{hour:02}:00")).collect();
    Json(json!({
        "days": days,
        "time_slots": time_slots,
        "schedule": state.schedule().snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleForm {
    pub day: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

pub async fn update_schedule(
    State(state): State<AppState>,
    user: AuthUser,
    Form(form): Form<ScheduleForm>,
) -> Result<Response, ApiError> {
    let day: Day = form.day.parse()?;
    let window = DayWindow::parse(form.start_time.as_deref(), form.end_time.as_deref())?;
    state.schedule().update_day(day.name(), window).await?;
    info!("{} updated the schedule for {}", user.username, day);
    Ok(redirect("/schedule"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

/// Latest published point values
pub async fn status(State(state): State<AppState>, _user: AuthUser) -> Json<Value> {
    let device = state.device();
    let values = device.values();
    let occupied_now = evaluate(&state.schedule().snapshot(), state.clock().now()).is_occupied;
    Json(json!({
        "device_instance": device.identity().instance,
        "points": values,
        "occupancy": values.occupancy.as_str(),
        "schedule_occupied_now": occupied_now,
    }))
}

/// Effective settings and every local object with its properties
pub async fn config(State(state): State<AppState>, _user: AuthUser) -> Json<Value> {
    Json(json!({
        "settings": state.config().redacted(),
        "objects": state.device().describe(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// BACnet client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WhoIsQuery {
    /// `ip` or `ip:port` to direct the request at
    pub address: Option<String>,
}

fn parse_address(raw: &str, default_port: u16) -> Result<SocketAddr, ApiError> {
    raw.parse::<SocketAddr>()
        .or_else(|_| raw.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, default_port)))
        .map_err(|_| ApiError::BadRequest(format!("invalid address {raw:?}")))
}

pub async fn who_is(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(device_instance): Path<u32>,
    Query(query): Query<WhoIsQuery>,
) -> Result<Json<Vec<IAm>>, ApiError> {
    let destination = query
        .address
        .as_deref()
        .map(|raw| parse_address(raw, state.config().bacnet.port))
        .transpose()?;
    let i_ams = state
        .bacnet()
        .who_is(WhoIs::device(device_instance), destination)
        .await?;
    Ok(Json(i_ams))
}

/// `{"<property>": value}`
fn property_json(property: PropertyReference, value: &PropertyValue) -> Value {
    let mut body = Map::new();
    body.insert(property.to_string(), value.to_json());
    Value::Object(body)
}

pub async fn read_present_value(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((device_instance, object)): Path<(u32, String)>,
) -> Result<Json<Value>, ApiError> {
    let object: ObjectIdentifier = object.parse()?;
    let value = state.bacnet().read_present_value(device_instance, object).await?;
    Ok(Json(property_json(PropertyReference::new(PropertyIdentifier::PresentValue), &value)))
}

pub async fn read_property(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((device_instance, object, property)): Path<(u32, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let object: ObjectIdentifier = object.parse()?;
    let property: PropertyReference = property.parse()?;
    let value = state
        .bacnet()
        .read_property(device_instance, object, property)
        .await?;
    Ok(Json(property_json(property, &value)))
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub value: Value,
    #[serde(default)]
    pub priority: Option<u8>,
}

pub async fn write_property(
    State(state): State<AppState>,
    user: AuthUser,
    Path((device_instance, object, property)): Path<(u32, String, String)>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<Value>, ApiError> {
    let object: ObjectIdentifier = object.parse()?;
    let property: PropertyReference = property.parse()?;
    let value = match &request.value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    };

    state
        .bacnet()
        .write_property(device_instance, object, property, &value, request.priority)
        .await?;
    info!(
        "{} wrote {} to {} {} on device {}",
        user.username, value, object, property, device_instance
    );
    Ok(Json(json!({ "written": true })))
}

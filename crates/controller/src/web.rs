use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use axum::Router;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::command::{Command, LightCommand, SettingsCommand, SprinklerCommand};
use crate::controller::{Controller, Reply};
use crate::dispatch::{Dispatcher, Route};
use crate::error::CommandError;
use crate::sensor::Location;

const HINT: &str = "If nothing happens, please check MQTT for errors.";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    fn controller(&self) -> &Controller {
        self.dispatcher.controller()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sprinkler/{sender}/{command}", get(sprinkler))
        .route("/light/{sender}/{command}", get(light))
        .route("/temperature/{location}", get(temperature))
        .route("/settings/{sender}/{command}", put(update_settings))
        .route("/settings", get(settings))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn status_for(e: &CommandError) -> StatusCode {
    if e.is_client_error() {
        return StatusCode::BAD_REQUEST;
    }
    match e {
        CommandError::ActuatorTransport(_) => StatusCode::BAD_GATEWAY,
        CommandError::SensorRead(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Path segments arrive as text; numeric ones are passed on as numbers.
fn path_value(raw: String) -> Value {
    match raw.parse::<i64>() {
        Ok(n) => n.into(),
        Err(_) => Value::String(raw),
    }
}

fn own_sender(sender: &str) -> String {
    format!("Sender \"{sender}\" is reserved for the controller")
}

/// Run a switch command and mirror the outcome on the bus.
async fn switch(
    app: &AppState,
    route: Route,
    sender: &str,
    parsed: Result<Command, CommandError>,
) -> Response {
    let outcome = match parsed {
        Ok(command) => app.dispatcher.execute(sender, command).await,
        Err(e) => Some(Err(e)),
    };
    let Some(outcome) = outcome else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "hint": own_sender(sender)})),
        )
            .into_response();
    };
    app.dispatcher.notify_outcome(route, &outcome).await;

    match outcome {
        Ok(_) => Json(json!({"success": true, "hint": HINT})).into_response(),
        Err(e) => (
            status_for(&e),
            Json(json!({"success": false, "hint": e.to_string()})),
        )
            .into_response(),
    }
}

async fn sprinkler(
    State(app): State<AppState>,
    Path((sender, command)): Path<(String, String)>,
) -> Response {
    let parsed = SprinklerCommand::parse(&path_value(command)).map(Command::Sprinkler);
    switch(&app, Route::Sprinkler, &sender, parsed).await
}

async fn light(
    State(app): State<AppState>,
    Path((sender, command)): Path<(String, String)>,
) -> Response {
    let parsed = LightCommand::parse(&path_value(command)).map(Command::Light);
    switch(&app, Route::Light, &sender, parsed).await
}

async fn temperature(State(app): State<AppState>, Path(location): Path<String>) -> Response {
    let location: Location = match location.parse() {
        Ok(l) => l,
        Err(hint) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "hint": hint})),
            )
                .into_response()
        }
    };

    let outcome = app.controller().read_temperature(location).await;
    app.dispatcher
        .notify_outcome(Route::Temperature(location), &outcome)
        .await;

    match outcome {
        Ok(Reply::Temperature(celsius)) => {
            Json(json!({"success": true, "temperature": celsius})).into_response()
        }
        Ok(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Err(e) => (
            status_for(&e),
            Json(json!({"success": false, "hint": e.to_string()})),
        )
            .into_response(),
    }
}

async fn update_settings(
    State(app): State<AppState>,
    Path((sender, command)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let bad_request =
        |msg: String| (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response();

    let body: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return bad_request(format!("Invalid JSON body: {e}")),
        }
    };

    let outcome = match SettingsCommand::from_http_body(&command, &body) {
        Ok(cmd) => app.dispatcher.execute(&sender, Command::Settings(cmd)).await,
        Err(e) => Some(Err(e)),
    };
    let Some(outcome) = outcome else {
        return bad_request(own_sender(&sender));
    };
    app.dispatcher.notify_outcome(Route::Settings, &outcome).await;

    match outcome {
        Ok(Reply::Settings(s)) => Json(json!({"success": true, "settings": s})).into_response(),
        Ok(_) => Json(json!({"success": true})).into_response(),
        Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn settings(State(app): State<AppState>) -> Response {
    match app.controller().persisted_settings().await {
        Ok(v) => Json(v).into_response(),
        Err(e) => {
            error!("failed to read settings file: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("{e:#}")})),
            )
                .into_response()
        }
    }
}

async fn status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.controller().status().await)
}

async fn metrics(State(app): State<AppState>) -> impl IntoResponse {
    let body = app.controller().shared().read().await.render_metrics();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

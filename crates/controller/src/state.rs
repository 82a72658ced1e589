use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::light::Rgb;
use crate::registry::RegistrySnapshot;
use crate::sensor::Location;
use crate::settings::Settings;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// What the controller last observed or did, for the status board and the
/// metrics endpoint. Nothing here drives decisions.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub sprinkler: SprinklerState,
    pub light: LightState,
    pub temperatures: Temperatures,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Default, Serialize)]
pub struct SprinklerState {
    pub on: bool,
    pub last_changed: Option<DateTime<Utc>>,
}

#[derive(Clone, Default, Serialize)]
pub struct LightState {
    /// `None` until the first directive reaches the controller.
    pub on: Option<bool>,
    pub color: Option<Rgb>,
    pub last_changed: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Serialize)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Default, Serialize)]
pub struct Temperatures {
    pub inside: Option<TemperatureReading>,
    pub outside: Option<TemperatureReading>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sprinkler,
    Light,
    Temperature,
    Settings,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub sprinkler: SprinklerState,
    pub light: LightState,
    pub temperatures: Temperatures,
    pub settings: Settings,
    pub schedules: RegistrySnapshot,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            sprinkler: SprinklerState::default(),
            light: LightState::default(),
            temperatures: Temperatures::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_sprinkler(&mut self, on: bool, detail: String) {
        self.sprinkler.on = on;
        self.sprinkler.last_changed = Some(Utc::now());
        self.push_event(EventKind::Sprinkler, detail);
    }

    /// Record a directive the light controller accepted.
    pub fn record_light(&mut self, on: bool, color: Option<Rgb>, detail: Option<String>) {
        if self.light.on != Some(on) {
            self.light.last_changed = Some(Utc::now());
        }
        self.light.on = Some(on);
        if color.is_some() {
            self.light.color = color;
        }
        if let Some(detail) = detail {
            self.push_event(EventKind::Light, detail);
        }
    }

    pub fn record_temperature(&mut self, location: Location, celsius: f64) {
        let reading = Some(TemperatureReading {
            celsius,
            at: Utc::now(),
        });
        match location {
            Location::Inside => self.temperatures.inside = reading,
            Location::Outside => self.temperatures.outside = reading,
        }
    }

    pub fn record_settings(&mut self, detail: String) {
        self.push_event(EventKind::Settings, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, settings: Settings, schedules: RegistrySnapshot) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            sprinkler: self.sprinkler.clone(),
            light: self.light.clone(),
            temperatures: self.temperatures.clone(),
            settings,
            schedules,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    /// Prometheus text exposition of the temperature gauges. A sensor that
    /// has never been read reports `NaN`.
    pub fn render_metrics(&self) -> String {
        let mut out = String::new();
        let gauges = [
            (
                "inside_temperature_celsius",
                "Temperature inside the terrarium in degrees Celsius.",
                self.temperatures.inside,
            ),
            (
                "outside_temperature_celsius",
                "Temperature outside the terrarium in degrees Celsius.",
                self.temperatures.outside,
            ),
        ];
        for (name, help, reading) in gauges {
            let value = reading.map_or(f64::NAN, |r| r.celsius);
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

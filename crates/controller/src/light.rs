//! Remote LED controller: JSON state directives over HTTP, plus the
//! temperature-to-color table used by the periodic color update.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::validate::TimeOfDay;

pub type Rgb = [u8; 3];

#[derive(Debug, Error)]
pub enum LightError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("light controller answered {0}")]
    Status(StatusCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub col: Vec<Rgb>,
}

/// Body of `POST /json/state`. Only `on` is mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LightDirective {
    pub on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bri: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub seg: Vec<Segment>,
}

impl LightDirective {
    pub fn power(on: bool) -> Self {
        Self {
            on,
            bri: None,
            seg: Vec::new(),
        }
    }

    pub fn ambient(on: bool, brightness: u8, color: Option<Rgb>) -> Self {
        Self {
            on,
            bri: Some(brightness),
            seg: color
                .map(|c| vec![Segment { col: vec![c] }])
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LightClient {
    url: String,
    client: Client,
}

impl LightClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LightError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One POST, no retry. Any non-2xx status counts as a failure.
    pub async fn send(&self, directive: &LightDirective) -> Result<(), LightError> {
        debug!(url = %self.url, on = directive.on, bri = ?directive.bri, "sending light directive");
        let resp = self.client.post(&self.url).json(directive).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LightError::Status(status));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Temperature color table
// ---------------------------------------------------------------------------

const COLOR_MIN_C: i64 = 10;
const COLOR_MAX_C: i64 = 40;

/// 10 °C (blue) to 40 °C (red), one entry per whole degree.
const TEMPERATURE_COLORS: [Rgb; 31] = [
    [0, 0, 255],
    [25, 25, 229],
    [51, 51, 204],
    [76, 76, 178],
    [102, 102, 153],
    [127, 127, 127],
    [153, 153, 102],
    [178, 178, 76],
    [204, 204, 51],
    [229, 229, 25],
    [255, 255, 0],
    [255, 255, 0],
    [255, 241, 0],
    [255, 228, 0],
    [255, 214, 0],
    [255, 201, 0],
    [255, 187, 0],
    [255, 174, 0],
    [255, 161, 0],
    [255, 147, 0],
    [255, 134, 0],
    [255, 120, 0],
    [255, 107, 0],
    [255, 93, 0],
    [255, 80, 0],
    [255, 67, 0],
    [255, 53, 0],
    [255, 40, 0],
    [255, 26, 0],
    [255, 13, 0],
    [255, 0, 0],
];

/// Color for a reading, rounded to the nearest degree and clamped to the
/// table's 10..=40 range.
pub fn color_for_temperature(celsius: f64) -> Rgb {
    let degree = if celsius.is_nan() {
        COLOR_MIN_C
    } else {
        (celsius.round() as i64).clamp(COLOR_MIN_C, COLOR_MAX_C)
    };
    TEMPERATURE_COLORS[(degree - COLOR_MIN_C) as usize]
}

// ---------------------------------------------------------------------------
// Daily window
// ---------------------------------------------------------------------------

/// Whether the light belongs on at `now_minute`. The window is
/// `[start, end)`; when `start > end` it wraps past midnight, and
/// `start == end` is an empty window.
pub fn light_window_active(start: TimeOfDay, end: TimeOfDay, now_minute: u16) -> bool {
    let (s, e) = (start.minute_of_day(), end.minute_of_day());
    if s <= e {
        s <= now_minute && now_minute < e
    } else {
        now_minute >= s || now_minute < e
    }
}

// ===========================================================================
// Tests
// ===========================================================================

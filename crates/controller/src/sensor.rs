//! DS18B20 one-wire temperature sensors, read through the kernel's `w1_slave`
//! files. No retries here; a failed read is reported and the round completes.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    /// CRC line did not report `YES`.
    #[error("sensor not ready")]
    NotReady,
    #[error("malformed sensor data: {0}")]
    Malformed(String),
    #[error("failed to read sensor file: {0}")]
    Io(#[from] std::io::Error),
}

/// Which of the two terrarium sensors a query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Inside,
    Outside,
}

impl Location {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inside => "inside",
            Self::Outside => "outside",
        }
    }
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "innen" | "inside" => Ok(Self::Inside),
            "aussen" | "außen" | "outside" => Ok(Self::Outside),
            other => Err(format!(
                "invalid location \"{other}\". Needs to be \"innen\" or \"aussen\"."
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorPaths {
    pub inside: PathBuf,
    pub outside: PathBuf,
}

impl SensorPaths {
    pub fn path(&self, location: Location) -> &Path {
        match location {
            Location::Inside => &self.inside,
            Location::Outside => &self.outside,
        }
    }
}

/// Parse the two-line `w1_slave` format:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_reading(raw: &str) -> Result<f64, SensorError> {
    let mut lines = raw.lines();

    let status = lines
        .next()
        .ok_or_else(|| SensorError::Malformed("empty sensor data".into()))?;
    if !status.contains("YES") {
        return Err(SensorError::NotReady);
    }

    let data = lines
        .next()
        .ok_or_else(|| SensorError::Malformed("missing temperature line".into()))?;
    let idx = data
        .find("t=")
        .ok_or_else(|| SensorError::Malformed(format!("no \"t=\" in {data:?}")))?;
    let digits = data[idx + 2..].trim();
    let milli: i64 = digits
        .parse()
        .map_err(|_| SensorError::Malformed(format!("not a number: {digits:?}")))?;

    Ok(milli as f64 / 1000.0)
}

/// Read and parse one sensor file.
pub async fn read_celsius(path: &Path) -> Result<f64, SensorError> {
    let raw = tokio::fs::read_to_string(path).await?;
    parse_reading(&raw)
}

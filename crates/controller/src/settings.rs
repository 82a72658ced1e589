//! User-adjustable settings and their JSON file.
//!
//! The file is a flat object holding the four settings fields. Every change
//! rewrites the whole record: read the current file, overlay the fields, write
//! it back. Only after the write succeeds does the in-memory copy change.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::validate::TimeOfDay;

/// Key older settings files use for the sprinkle duration.
const LEGACY_DURATION_KEY: &str = "sprinkleLengthMS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub sprinkler_times: Vec<TimeOfDay>,
    #[serde(alias = "sprinkleLengthMS")]
    pub sprinkle_duration_ms: u64,
    pub light_start: TimeOfDay,
    pub light_end: TimeOfDay,
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.sprinkle_duration_ms == 0 {
            bail!("sprinkleDurationMs must be positive");
        }
        Ok(())
    }
}

pub struct SettingsStore {
    path: PathBuf,
    current: Settings,
}

impl SettingsStore {
    /// Load the settings file once at startup. Any problem here is fatal to
    /// the caller: the controller cannot schedule anything without it.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read settings: {}", path.display()))?;
        let current: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        current
            .validate()
            .with_context(|| format!("invalid settings: {}", path.display()))?;

        info!(
            path = %path.display(),
            sprinkler_times = current.sprinkler_times.len(),
            sprinkle_duration_ms = current.sprinkle_duration_ms,
            light_start = %current.light_start,
            light_end = %current.light_end,
            "settings loaded"
        );

        Ok(Self { path, current })
    }

    pub fn get(&self) -> &Settings {
        &self.current
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` to a copy of the settings, persist the copy, then make
    /// it current. On error nothing changes in memory.
    pub async fn update<F>(&mut self, mutate: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut next = self.current.clone();
        mutate(&mut next);
        next.validate()?;

        self.persist(&next).await?;
        self.current = next;
        Ok(self.current.clone())
    }

    async fn persist(&self, settings: &Settings) -> Result<()> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut record: Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a JSON object", self.path.display()))?;

        let Value::Object(fields) = serde_json::to_value(settings)? else {
            bail!("settings did not serialize to an object");
        };
        record.remove(LEGACY_DURATION_KEY);
        record.extend(fields);

        let mut payload = serde_json::to_string_pretty(&record)?;
        payload.push('\n');
        tokio::fs::write(&self.path, payload)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

//! TOML config file loading, environment overrides, and validation.
//!
//! Every value has a default matching the stock terrarium wiring, so the
//! file is optional. Environment variables override whatever the file says.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sensor::{Location, SensorPaths};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub topics: Topics,
    pub sensors: SensorsConfig,
    pub relay: RelayConfig,
    pub light: LightConfig,
    pub web: WebConfig,
    pub settings: SettingsFileConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Identity put in every outbound `sender` field. Inbound messages
    /// carrying it are our own echoes and get dropped.
    pub sender: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.25".into(),
            port: 1883,
            client_id: "terrarium-controller".into(),
            sender: "Terrarium".into(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub sprinkler: String,
    pub light: String,
    pub temperature_inside: String,
    pub temperature_outside: String,
    pub settings: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            sprinkler: "terrarium/regenanlage".into(),
            light: "terrarium/licht".into(),
            temperature_inside: "terrarium/temperatur/innen".into(),
            temperature_outside: "terrarium/temperatur/außen".into(),
            settings: "terrarium/settings".into(),
        }
    }
}

impl Topics {
    pub fn temperature(&self, location: Location) -> &str {
        match location {
            Location::Inside => &self.temperature_inside,
            Location::Outside => &self.temperature_outside,
        }
    }

    /// Every topic the controller subscribes to.
    pub fn all(&self) -> [&str; 5] {
        [
            &self.sprinkler,
            &self.light,
            &self.temperature_inside,
            &self.temperature_outside,
            &self.settings,
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub inside: PathBuf,
    pub outside: PathBuf,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            inside: "/sys/bus/w1/devices/28-357f541f64ff/w1_slave".into(),
            outside: "/sys/bus/w1/devices/28-e978541f64ff/w1_slave".into(),
        }
    }
}

impl SensorsConfig {
    pub fn paths(&self) -> SensorPaths {
        SensorPaths {
            inside: self.inside.clone(),
            outside: self.outside.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub gpio_pin: i64,
    pub active_low: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 4,
            active_low: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub brightness: u8,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            url: "http://terrariumled.local/json/state".into(),
            timeout_ms: 5000,
            brightness: 255,
        }
    }
}

impl LightConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 17000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettingsFileConfig {
    pub path: PathBuf,
}

impl Default for SettingsFileConfig {
    fn default() -> Self {
        Self {
            path: "config.json".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Overlay environment variables. `lookup` is `std::env::var` in
    /// production; tests pass a map. Unparsable values are all reported at
    /// once.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        macro_rules! text {
            ($var:literal => $field:expr) => {
                if let Some(v) = lookup($var) {
                    $field = v.into();
                }
            };
        }
        macro_rules! parsed {
            ($var:literal => $field:expr) => {
                if let Some(v) = lookup($var) {
                    match v.trim().parse() {
                        Ok(n) => $field = n,
                        Err(_) => errors.push(format!("{}: cannot parse {v:?}", $var)),
                    }
                }
            };
        }

        text!("MQTT_HOST" => self.mqtt.host);
        parsed!("MQTT_PORT" => self.mqtt.port);
        text!("MQTT_CLIENT_ID" => self.mqtt.client_id);
        text!("MQTT_SENDER" => self.mqtt.sender);

        text!("TOPIC_SPRINKLER" => self.topics.sprinkler);
        text!("TOPIC_LIGHT" => self.topics.light);
        text!("TOPIC_TEMPERATURE_INSIDE" => self.topics.temperature_inside);
        text!("TOPIC_TEMPERATURE_OUTSIDE" => self.topics.temperature_outside);
        text!("TOPIC_SETTINGS" => self.topics.settings);

        text!("SENSOR_INSIDE" => self.sensors.inside);
        text!("SENSOR_OUTSIDE" => self.sensors.outside);

        parsed!("RELAY_GPIO_PIN" => self.relay.gpio_pin);
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            match parse_bool(&v) {
                Some(b) => self.relay.active_low = b,
                None => errors.push(format!("RELAY_ACTIVE_LOW: cannot parse {v:?}")),
            }
        }

        text!("LIGHT_URL" => self.light.url);
        parsed!("LIGHT_TIMEOUT_MS" => self.light.timeout_ms);

        parsed!("WEB_PORT" => self.web.port);
        text!("SETTINGS_PATH" => self.settings.path);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("bad environment overrides:\n  - {}", errors.join("\n  - "));
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.sender.trim().is_empty() {
            errors.push("mqtt.sender is empty".into());
        }
        if m.keep_alive_secs == 0 {
            errors.push("mqtt.keep_alive_secs must be positive".into());
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let named = [
            ("sprinkler", &self.topics.sprinkler),
            ("light", &self.topics.light),
            ("temperature_inside", &self.topics.temperature_inside),
            ("temperature_outside", &self.topics.temperature_outside),
            ("settings", &self.topics.settings),
        ];
        let mut seen: HashSet<&str> = HashSet::new();

        for (key, topic) in named {
            if topic.trim().is_empty() {
                errors.push(format!("topics.{key} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!("topics.{key} '{topic}' must not contain wildcards"));
            } else if !seen.insert(topic.as_str()) {
                errors.push(format!("topics.{key} '{topic}' is already used by another topic"));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        // ── Sensors ─────────────────────────────────────────
        if self.sensors.inside.as_os_str().is_empty() {
            errors.push("sensors.inside is empty".into());
        }
        if self.sensors.outside.as_os_str().is_empty() {
            errors.push("sensors.outside is empty".into());
        }

        // ── Relay GPIO pin whitelist ────────────────────────
        if !VALID_GPIO_PINS.contains(&self.relay.gpio_pin) {
            errors.push(format!(
                "relay.gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.relay.gpio_pin
            ));
        }

        // ── Light controller ────────────────────────────────
        let url = &self.light.url;
        match reqwest::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => errors.push(format!(
                "light.url '{url}' must be an http(s) URL, got scheme '{}'",
                parsed.scheme()
            )),
            Err(e) => errors.push(format!("light.url '{url}' must be an http(s) URL: {e}")),
        }
        if self.light.timeout_ms == 0 {
            errors.push("light.timeout_ms must be positive".into());
        }

        // ── Web + settings file ─────────────────────────────
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }
        if self.settings.path.as_os_str().is_empty() {
            errors.push("settings.path is empty".into());
        }
    }

    /// GPIO pin as the relay driver takes it. Only meaningful after
    /// `validate` passed.
    pub fn relay_pin(&self) -> u8 {
        u8::try_from(self.relay.gpio_pin).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, then
/// validate. A missing file means "all defaults".
pub fn load(path: &str) -> Result<Config> {
    load_with(Path::new(path), |k| std::env::var(k).ok())
}

fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };

    config.apply_env(lookup)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

//! Typed device commands and the payload-shape rules that produce them.
//!
//! MQTT and HTTP deliver the same commands in slightly different shapes; both
//! are normalised here so handlers only ever see validated values.

use serde_json::Value;

use crate::error::CommandError;
use crate::sensor::Location;
use crate::validate::{validate_duration_ms, TimeOfDay};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SprinklerCommand {
    /// Relay on, auto-off after the configured duration.
    On,
    /// Relay off immediately.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightCommand {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsCommand {
    SetSprinklerTimes(Vec<TimeOfDay>),
    SetSprinkleDurationMs(u64),
    SetLightStart(TimeOfDay),
    SetLightEnd(TimeOfDay),
    GetSettings,
}

/// A validated command bound for one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sprinkler(SprinklerCommand),
    Light(LightCommand),
    Temperature(Location),
    Settings(SettingsCommand),
}

const SETTINGS_COMMANDS: &str =
    "\"setSprinklerTimes\", \"setSprinkleLengthMs\", \"setLightStart\", \"setLightEnd\" or \"getSettings\"";

/// Read an integer switch value the way loose clients send it: `1`, `"1"`,
/// `" 0 "`.
fn switch_value(command: &Value) -> Option<i64> {
    match command {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl SprinklerCommand {
    pub fn parse(command: &Value) -> Result<Self, CommandError> {
        match switch_value(command) {
            Some(1) => Ok(Self::On),
            Some(0) => Ok(Self::Off),
            _ => Err(CommandError::InvalidCommand(format!(
                "Invalid command value {command}: \"command\" needs to be 1 (on) or 0 (off)"
            ))),
        }
    }
}

impl LightCommand {
    pub fn parse(command: &Value) -> Result<Self, CommandError> {
        match switch_value(command) {
            Some(1) => Ok(Self::On),
            Some(0) => Ok(Self::Off),
            _ => Err(CommandError::InvalidCommand(format!(
                "Invalid command value {command}: \"command\" needs to be 1 (on) or 0 (off)"
            ))),
        }
    }
}

/// Parse a message on the sprinkler topic. Besides `1`/`0`, an array of times
/// (as `command`, or as `value` with `command: -1`) replaces the schedule.
pub fn parse_sprinkler_message(command: &Value, value: Option<&Value>) -> Result<Command, CommandError> {
    if command.is_array() {
        return parse_time_list(Some(command))
            .map(|times| Command::Settings(SettingsCommand::SetSprinklerTimes(times)));
    }
    if switch_value(command) == Some(-1) {
        return parse_time_list(value)
            .map(|times| Command::Settings(SettingsCommand::SetSprinklerTimes(times)));
    }
    SprinklerCommand::parse(command).map(Command::Sprinkler)
}

fn parse_time_list(value: Option<&Value>) -> Result<Vec<TimeOfDay>, CommandError> {
    let items = match value {
        None | Some(Value::Null) => {
            return Err(CommandError::InvalidValue("No times found to set".into()))
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(CommandError::InvalidValue(
                "Invalid time value. time has to be an array with hh:mm format values".into(),
            ))
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.parse::<TimeOfDay>(),
            other => Err(CommandError::InvalidValue(format!(
                "Invalid time format: {other}. Please use hh:mm in 24h format"
            ))),
        })
        .collect()
}

fn parse_single_time(value: Option<&Value>) -> Result<TimeOfDay, CommandError> {
    match value {
        None | Some(Value::Null) => Err(CommandError::InvalidValue("No time found to set".into())),
        Some(Value::String(s)) => s.parse(),
        Some(_) => Err(CommandError::InvalidValue(
            "Invalid time value. time has to be a string with hh:mm format".into(),
        )),
    }
}

fn parse_duration(value: Option<&Value>) -> Result<u64, CommandError> {
    match value {
        None | Some(Value::Null) => Err(CommandError::InvalidValue("No time found to set".into())),
        Some(v) => validate_duration_ms(v),
    }
}

fn unknown_settings_command(name: &str) -> CommandError {
    CommandError::InvalidCommand(format!(
        "Invalid command value \"{name}\": \"command\" needs to be {SETTINGS_COMMANDS}"
    ))
}

impl SettingsCommand {
    /// Validate a settings command as carried on the message bus: `value` is
    /// the bare payload (array, number, string, string, nothing).
    pub fn from_message(name: &str, value: Option<&Value>) -> Result<Self, CommandError> {
        match name {
            "setSprinklerTimes" => parse_time_list(value).map(Self::SetSprinklerTimes),
            "setSprinkleLengthMs" | "setSprinkleLengthMS" => {
                parse_duration(value).map(Self::SetSprinkleDurationMs)
            }
            "setLightStart" => parse_single_time(value).map(Self::SetLightStart),
            "setLightEnd" => parse_single_time(value).map(Self::SetLightEnd),
            "getSettings" => Ok(Self::GetSettings),
            other => Err(unknown_settings_command(other)),
        }
    }

    /// Validate a settings command as sent to `PUT /settings/{sender}/{name}`:
    /// times are a bare array, scalars are wrapped in an object keyed by the
    /// settings field.
    pub fn from_http_body(name: &str, body: &Value) -> Result<Self, CommandError> {
        match name {
            "setSprinklerTimes" if !body.is_array() => Err(CommandError::InvalidValue(
                "Invalid time format. Body needs to be an array of hh:mm strings in 24h format"
                    .into(),
            )),
            "setSprinklerTimes" => parse_time_list(Some(body)).map(Self::SetSprinklerTimes),
            "setSprinkleLengthMs" | "setSprinkleLengthMS" => {
                let field = body
                    .get("sprinkleDurationMs")
                    .or_else(|| body.get("sprinkleLengthMS"));
                match field {
                    Some(v) => validate_duration_ms(v).map(Self::SetSprinkleDurationMs),
                    None => Err(CommandError::InvalidValue(
                        "Invalid value. Body needs to have \"sprinkleDurationMs\" key with a positive numerical value."
                            .into(),
                    )),
                }
            }
            "setLightStart" => field_time(body, "lightStart").map(Self::SetLightStart),
            "setLightEnd" => field_time(body, "lightEnd").map(Self::SetLightEnd),
            "getSettings" => Ok(Self::GetSettings),
            other => Err(unknown_settings_command(other)),
        }
    }
}

fn field_time(body: &Value, key: &str) -> Result<TimeOfDay, CommandError> {
    body.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CommandError::InvalidValue(format!(
                "Invalid value. Body needs to have \"{key}\" key with a hh:mm in 24h format string."
            ))
        })
}

//! Inbound command routing shared by the MQTT listener and the HTTP API.
//!
//! Both transports normalise to `(sender, Command)` and call `execute`; the
//! only difference is how the outcome is surfaced. MQTT outcomes are always
//! published back on the topic the command arrived on.

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{parse_sprinkler_message, Command, LightCommand, SettingsCommand};
use crate::config::Topics;
use crate::controller::{Controller, Reply};
use crate::error::CommandError;
use crate::sensor::Location;

// ---------------------------------------------------------------------------
// Topic routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Sprinkler,
    Light,
    Temperature(Location),
    Settings,
}

impl Route {
    pub fn from_topic(topic: &str, topics: &Topics) -> Option<Self> {
        if topic == topics.sprinkler {
            Some(Self::Sprinkler)
        } else if topic == topics.light {
            Some(Self::Light)
        } else if topic == topics.temperature_inside {
            Some(Self::Temperature(Location::Inside))
        } else if topic == topics.temperature_outside {
            Some(Self::Temperature(Location::Outside))
        } else if topic == topics.settings {
            Some(Self::Settings)
        } else {
            None
        }
    }

    /// Topic where outcomes for this route are published.
    pub fn topic(self, topics: &Topics) -> &str {
        match self {
            Self::Sprinkler => &topics.sprinkler,
            Self::Light => &topics.light,
            Self::Temperature(location) => topics.temperature(location),
            Self::Settings => &topics.settings,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// `{sender, command, value?}` as published by clients. Some clients send
/// the value under `time`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sender: String,
    pub command: Value,
    pub value: Option<Value>,
}

pub fn parse_inbound(payload: &[u8]) -> Result<InboundMessage, CommandError> {
    let text = String::from_utf8_lossy(payload);
    let invalid = |reason: String| CommandError::InvalidMessageFormat {
        payload: text.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(invalid("payload is not a JSON object".into()));
    };

    let sender = match fields.remove("sender") {
        None => return Err(invalid("Key \"sender\" is missing".into())),
        Some(Value::String(s)) => s,
        Some(_) => return Err(invalid("Key \"sender\" must be a string".into())),
    };

    Ok(InboundMessage {
        sender,
        command: fields.remove("command").unwrap_or(Value::Null),
        value: take_value(&mut fields),
    })
}

fn take_value(fields: &mut Map<String, Value>) -> Option<Value> {
    fields
        .remove("value")
        .or_else(|| fields.remove("time"))
        .filter(|v| !v.is_null())
}

/// Validate a bus message into the command its topic stands for.
pub fn command_for(route: Route, msg: &InboundMessage) -> Result<Command, CommandError> {
    match route {
        Route::Sprinkler => parse_sprinkler_message(&msg.command, msg.value.as_ref()),
        Route::Light => LightCommand::parse(&msg.command).map(Command::Light),
        Route::Temperature(location) => Ok(Command::Temperature(location)),
        Route::Settings => {
            let name = match &msg.command {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            SettingsCommand::from_message(&name, msg.value.as_ref()).map(Command::Settings)
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    controller: Controller,
}

impl Dispatcher {
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn is_own(&self, sender: &str) -> bool {
        sender == self.controller.notifier().identity()
    }

    /// Run `command` on behalf of `sender`. Returns `None`, without touching
    /// any handler, when `sender` is the controller itself.
    pub async fn execute(
        &self,
        sender: &str,
        command: Command,
    ) -> Option<Result<Reply, CommandError>> {
        if self.is_own(sender) {
            debug!(sender, "dropping own message");
            return None;
        }
        debug!(sender, ?command, "dispatching");
        let outcome = match command {
            Command::Sprinkler(cmd) => self.controller.sprinkler_command(cmd).await,
            Command::Light(cmd) => self.controller.light_command(cmd).await,
            Command::Temperature(location) => self.controller.read_temperature(location).await,
            Command::Settings(cmd) => self.controller.settings_command(cmd).await,
        };
        Some(outcome)
    }

    /// Publish a handler outcome on the route's topic.
    pub async fn notify_outcome(&self, route: Route, outcome: &Result<Reply, CommandError>) {
        let topic = route.topic(self.controller.topics());
        self.notify_on(topic, outcome).await;
    }

    async fn notify_on(&self, topic: &str, outcome: &Result<Reply, CommandError>) {
        let notifier = self.controller.notifier();
        match outcome {
            Ok(Reply::Text(message)) => notifier.notify(topic, message),
            Ok(Reply::Temperature(celsius)) => notifier.notify(topic, celsius),
            Ok(Reply::Settings(settings)) => notifier.notify(topic, settings),
            Err(e) => {
                warn!(topic, "{e}");
                self.controller
                    .shared()
                    .write()
                    .await
                    .record_error(e.to_string());
                notifier.notify(topic, e.to_string());
            }
        }
    }

    /// Handle broker publishes one at a time, in the order they were
    /// received, until every sender is dropped.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        while let Some((topic, payload)) = inbound.recv().await {
            self.handle_mqtt(&topic, &payload).await;
        }
        info!("inbound queue closed");
    }

    /// Handle one publish from the broker.
    pub async fn handle_mqtt(&self, topic: &str, payload: &[u8]) {
        let Some(route) = Route::from_topic(topic, self.controller.topics()) else {
            warn!(topic, "unhandled topic");
            return;
        };

        let msg = match parse_inbound(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.notify_on(topic, &Err(e)).await;
                return;
            }
        };
        // Own status messages come back on every topic we publish to; drop
        // them before they are mistaken for malformed commands.
        if self.is_own(&msg.sender) {
            debug!(topic, "dropping own message");
            return;
        }

        let outcome = match command_for(route, &msg) {
            Ok(command) => self.execute(&msg.sender, command).await,
            Err(e) => Some(Err(e)),
        };
        if let Some(outcome) = outcome {
            self.notify_on(topic, &outcome).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

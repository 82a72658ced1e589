//! The terrarium's one owner of mutable device state.
//!
//! Settings, the schedule registry and the relay live in a single `Core`
//! behind one async mutex. Command handlers, cron job bodies and sprinkler
//! turn-off timers all take that lock before touching any of them, so two
//! mutations never interleave.
//!
//! Command handlers return a `Reply` and leave notifying to the caller.
//! Scheduled work (cron fires, turn-off timers, periodic polls) has no caller
//! and publishes its own outcome.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, Timelike};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};

use crate::command::{LightCommand, SettingsCommand, SprinklerCommand};
use crate::config::Topics;
use crate::error::CommandError;
use crate::light::{color_for_temperature, light_window_active, LightClient, LightDirective};
use crate::notifier::Notifier;
use crate::registry::{RegistrySnapshot, ScheduleRegistry};
use crate::relay::SprinklerRelay;
use crate::sensor::{read_celsius, Location, SensorPaths};
use crate::settings::{Settings, SettingsStore};
use crate::state::{SharedState, StatusResponse};
use crate::validate::TimeOfDay;

const COLOR_UPDATE_SCHEDULE: &str = "0 */5 * * * *";
const TEMPERATURE_POLL_SCHEDULE: &str = "0 */3 * * * *";

const MSG_START_SPRINKLING: &str = "Start sprinkling";
const MSG_STOP_SPRINKLING: &str = "Stop sprinkling";
const MSG_LIGHT_ON: &str = "Turning light on";
const MSG_LIGHT_OFF: &str = "Turning light off";

/// Successful outcome of a command handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Temperature(f64),
    Settings(Settings),
}

/// Work a cron entry triggers.
#[derive(Debug, Clone, Copy)]
enum JobAction {
    Sprinkle,
    Light(bool),
    ColorUpdate,
    TemperaturePoll,
}

struct Core {
    settings: SettingsStore,
    registry: ScheduleRegistry,
    /// `None` once released at shutdown.
    relay: Option<SprinklerRelay>,
    active_cycle: Option<u64>,
    next_cycle: u64,
}

impl Core {
    fn set_relay(&mut self, on: bool) {
        match self.relay.as_mut() {
            Some(relay) => relay.set(on),
            None => warn!(on, "relay already released, ignoring"),
        }
    }
}

struct Inner {
    core: Mutex<Core>,
    scheduler: JobScheduler,
    light: LightClient,
    notifier: Notifier,
    shared: SharedState,
    topics: Topics,
    sensors: SensorPaths,
    brightness: u8,
}

/// Everything the controller is built from.
pub struct ControllerParts {
    pub settings: SettingsStore,
    pub relay: SprinklerRelay,
    pub scheduler: JobScheduler,
    pub light: LightClient,
    pub notifier: Notifier,
    pub shared: SharedState,
    pub topics: Topics,
    pub sensors: SensorPaths,
    pub brightness: u8,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(parts: ControllerParts) -> Self {
        let registry = ScheduleRegistry::new(parts.scheduler.clone());
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    settings: parts.settings,
                    registry,
                    relay: Some(parts.relay),
                    active_cycle: None,
                    next_cycle: 1,
                }),
                scheduler: parts.scheduler,
                light: parts.light,
                notifier: parts.notifier,
                shared: parts.shared,
                topics: parts.topics,
                sensors: parts.sensors,
                brightness: parts.brightness,
            }),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.inner.topics
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn shared(&self) -> &SharedState {
        &self.inner.shared
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Install every schedule from the loaded settings, bring the light in
    /// line with its window, take one color update and one temperature
    /// reading, then start the scheduler.
    pub async fn start(&self) -> Result<()> {
        self.install_schedules().await?;
        self.sync_light_window().await;
        self.update_light_color().await;
        self.poll_temperatures().await;
        self.inner
            .scheduler
            .start()
            .await
            .context("failed to start job scheduler")?;
        self.inner
            .shared
            .write()
            .await
            .record_system("controller started".into());
        info!("controller started");
        Ok(())
    }

    async fn install_schedules(&self) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        let settings = core.settings.get().clone();

        let jobs = settings
            .sprinkler_times
            .iter()
            .map(|t| self.daily_job(*t, JobAction::Sprinkle))
            .collect::<Result<Vec<_>, _>>()?;
        core.registry.replace_sprinkler_jobs(jobs).await?;
        core.registry
            .replace_light_start(self.daily_job(settings.light_start, JobAction::Light(true))?)
            .await?;
        core.registry
            .replace_light_end(self.daily_job(settings.light_end, JobAction::Light(false))?)
            .await?;
        core.registry
            .install_color_update(self.periodic_job(COLOR_UPDATE_SCHEDULE, JobAction::ColorUpdate)?)
            .await?;
        core.registry
            .install_temperature_poll(
                self.periodic_job(TEMPERATURE_POLL_SCHEDULE, JobAction::TemperaturePoll)?,
            )
            .await?;

        info!(
            sprinkler_jobs = core.registry.sprinkler_job_count(),
            light_start = %settings.light_start,
            light_end = %settings.light_end,
            "schedules installed"
        );
        Ok(())
    }

    /// Stop the scheduler, abort a pending turn-off and release the relay.
    pub async fn shutdown(&self) {
        let mut scheduler = self.inner.scheduler.clone();
        if let Err(e) = scheduler.shutdown().await {
            warn!("job scheduler shutdown failed: {e}");
        }

        let mut core = self.inner.core.lock().await;
        if let Some(cycle) = core.registry.abort_pending() {
            debug!(cycle, "aborted pending turn-off");
        }
        core.active_cycle = None;
        if let Some(relay) = core.relay.take() {
            relay.release();
        }
        info!("controller stopped");
    }

    // -----------------------------------------------------------------------
    // Job construction
    // -----------------------------------------------------------------------

    fn job(&self, schedule: &str, action: JobAction) -> Result<Job, JobSchedulerError> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Job::new_async_tz(schedule, Local, move |_id, _sched| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Controller { inner }.run_job(action).await;
                }
            })
        })
    }

    fn daily_job(&self, time: TimeOfDay, action: JobAction) -> Result<Job, JobSchedulerError> {
        self.job(&time.cron_spec().to_string(), action)
    }

    fn periodic_job(&self, schedule: &str, action: JobAction) -> Result<Job, JobSchedulerError> {
        self.job(schedule, action)
    }

    async fn run_job(&self, action: JobAction) {
        debug!(?action, "job fired");
        match action {
            JobAction::Sprinkle => self.fire_sprinkler().await,
            JobAction::Light(on) => self.fire_light(on).await,
            JobAction::ColorUpdate => self.update_light_color().await,
            JobAction::TemperaturePoll => self.poll_temperatures().await,
        }
    }

    // -----------------------------------------------------------------------
    // Sprinkler
    // -----------------------------------------------------------------------

    pub async fn sprinkler_command(&self, cmd: SprinklerCommand) -> Result<Reply, CommandError> {
        let mut core = self.inner.core.lock().await;
        let message = match cmd {
            SprinklerCommand::On => self.start_cycle(&mut core).await,
            SprinklerCommand::Off => {
                if let Some(cycle) = core.registry.abort_pending() {
                    debug!(cycle, "manual stop cancelled pending turn-off");
                }
                core.active_cycle = None;
                core.set_relay(false);
                self.inner
                    .shared
                    .write()
                    .await
                    .record_sprinkler(false, MSG_STOP_SPRINKLING.into());
                info!("{MSG_STOP_SPRINKLING}");
                MSG_STOP_SPRINKLING
            }
        };
        Ok(Reply::Text(message.into()))
    }

    async fn fire_sprinkler(&self) {
        let mut core = self.inner.core.lock().await;
        let message = self.start_cycle(&mut core).await;
        drop(core);
        self.inner.notifier.notify(&self.inner.topics.sprinkler, message);
    }

    /// Raise the relay and arm the turn-off with the duration current now.
    async fn start_cycle(&self, core: &mut Core) -> &'static str {
        let cycle = core.next_cycle;
        core.next_cycle += 1;
        let duration = Duration::from_millis(core.settings.get().sprinkle_duration_ms);

        core.set_relay(true);
        core.active_cycle = Some(cycle);

        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = weak.upgrade() {
                Controller { inner }.finish_cycle(cycle).await;
            }
        });
        core.registry.arm_turn_off(cycle, duration, timer);

        self.inner
            .shared
            .write()
            .await
            .record_sprinkler(true, MSG_START_SPRINKLING.into());
        info!(cycle, duration_ms = duration.as_millis() as u64, "{MSG_START_SPRINKLING}");
        MSG_START_SPRINKLING
    }

    /// Turn-off timer body. A cycle that was superseded or stopped by hand
    /// leaves the relay alone.
    async fn finish_cycle(&self, cycle: u64) {
        let mut core = self.inner.core.lock().await;
        if !core.registry.complete_turn_off(cycle) || core.active_cycle != Some(cycle) {
            debug!(cycle, "turn-off no longer current, skipping");
            return;
        }
        core.active_cycle = None;
        core.set_relay(false);
        drop(core);

        self.inner
            .shared
            .write()
            .await
            .record_sprinkler(false, MSG_STOP_SPRINKLING.into());
        info!(cycle, "{MSG_STOP_SPRINKLING}");
        self.inner
            .notifier
            .notify(&self.inner.topics.sprinkler, MSG_STOP_SPRINKLING);
    }

    // -----------------------------------------------------------------------
    // Light
    // -----------------------------------------------------------------------

    pub async fn light_command(&self, cmd: LightCommand) -> Result<Reply, CommandError> {
        let _core = self.inner.core.lock().await;
        let on = cmd == LightCommand::On;
        self.switch_light(on).await?;
        Ok(Reply::Text(light_message(on).into()))
    }

    async fn switch_light(&self, on: bool) -> Result<(), CommandError> {
        self.inner.light.send(&LightDirective::power(on)).await?;
        let message = light_message(on);
        self.inner
            .shared
            .write()
            .await
            .record_light(on, None, Some(message.into()));
        info!("{message}");
        Ok(())
    }

    async fn fire_light(&self, on: bool) {
        let _core = self.inner.core.lock().await;
        let result = self.switch_light(on).await;
        self.report_light(result.map(|()| light_message(on))).await;
    }

    /// Put the light in the state its daily window calls for right now.
    async fn sync_light_window(&self) {
        let core = self.inner.core.lock().await;
        let s = core.settings.get();
        let on = light_window_active(s.light_start, s.light_end, minute_of_day_now());
        let result = self.switch_light(on).await;
        drop(core);
        self.report_light(result.map(|()| light_message(on))).await;
    }

    async fn report_light(&self, result: Result<&str, CommandError>) {
        match result {
            Ok(message) => self.inner.notifier.notify(&self.inner.topics.light, message),
            Err(e) => {
                error!("light directive failed: {e}");
                let message = e.to_string();
                self.inner.shared.write().await.record_error(message.clone());
                self.inner.notifier.notify(&self.inner.topics.light, message);
            }
        }
    }

    /// Periodic color update: inside temperature picks the color, the daily
    /// window picks on/off, all in one directive. A failed sensor read still
    /// sends on/off and brightness.
    pub async fn update_light_color(&self) {
        let core = self.inner.core.lock().await;
        let s = core.settings.get();
        let on = light_window_active(s.light_start, s.light_end, minute_of_day_now());

        let color = match self.read_sensor(Location::Inside).await {
            Ok(celsius) => Some(color_for_temperature(celsius)),
            Err(e) => {
                self.report_sensor_error(Location::Inside, &e).await;
                None
            }
        };

        let directive = LightDirective::ambient(on, self.inner.brightness, color);
        let result = self.inner.light.send(&directive).await;
        drop(core);

        match result {
            Ok(()) => {
                debug!(on, ?color, "light color updated");
                self.inner.shared.write().await.record_light(on, color, None);
            }
            Err(e) => self.report_light(Err(e.into())).await,
        }
    }

    // -----------------------------------------------------------------------
    // Temperature
    // -----------------------------------------------------------------------

    async fn read_sensor(&self, location: Location) -> Result<f64, CommandError> {
        let celsius = read_celsius(self.inner.sensors.path(location)).await?;
        self.inner
            .shared
            .write()
            .await
            .record_temperature(location, celsius);
        debug!(location = location.as_str(), celsius, "temperature read");
        Ok(celsius)
    }

    pub async fn read_temperature(&self, location: Location) -> Result<Reply, CommandError> {
        self.read_sensor(location).await.map(Reply::Temperature)
    }

    async fn report_sensor_error(&self, location: Location, e: &CommandError) {
        warn!(location = location.as_str(), "{e}");
        let message = e.to_string();
        self.inner.shared.write().await.record_error(message.clone());
        self.inner
            .notifier
            .notify(self.inner.topics.temperature(location), message);
    }

    /// Refresh both gauges. Failures are reported per sensor and do not stop
    /// the other read.
    pub async fn poll_temperatures(&self) {
        for location in [Location::Inside, Location::Outside] {
            if let Err(e) = self.read_sensor(location).await {
                self.report_sensor_error(location, &e).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Validate-then-apply: jobs are built first, the file is written next,
    /// and only then do memory and the registry change. Any failure before
    /// the write leaves everything as it was.
    pub async fn settings_command(&self, cmd: SettingsCommand) -> Result<Reply, CommandError> {
        let mut core = self.inner.core.lock().await;

        let reply = match cmd {
            SettingsCommand::GetSettings => {
                return Ok(Reply::Settings(core.settings.get().clone()));
            }
            SettingsCommand::SetSprinklerTimes(times) => {
                let jobs = times
                    .iter()
                    .map(|t| self.daily_job(*t, JobAction::Sprinkle))
                    .collect::<Result<Vec<_>, _>>()?;
                let previous = core.settings.get().sprinkler_times.clone();
                core.settings
                    .update(|s| s.sprinkler_times = times.clone())
                    .await
                    .map_err(CommandError::Persistence)?;
                if let Err(e) = core.registry.replace_sprinkler_jobs(jobs).await {
                    error!("installing sprinkler jobs failed, restoring previous times: {e}");
                    self.restore_sprinkler_times(&mut core, previous).await;
                    return Err(e.into());
                }
                "Successfully set new times".to_string()
            }
            SettingsCommand::SetSprinkleDurationMs(ms) => {
                core.settings
                    .update(|s| s.sprinkle_duration_ms = ms)
                    .await
                    .map_err(CommandError::Persistence)?;
                format!("Sprinkler now will sprinkle {} seconds.", ms as f64 / 1000.0)
            }
            SettingsCommand::SetLightStart(time) => {
                let job = self.daily_job(time, JobAction::Light(true))?;
                core.settings
                    .update(|s| s.light_start = time)
                    .await
                    .map_err(CommandError::Persistence)?;
                core.registry.replace_light_start(job).await?;
                format!("Light will turn on at {time}")
            }
            SettingsCommand::SetLightEnd(time) => {
                let job = self.daily_job(time, JobAction::Light(false))?;
                core.settings
                    .update(|s| s.light_end = time)
                    .await
                    .map_err(CommandError::Persistence)?;
                core.registry.replace_light_end(job).await?;
                format!("Light will turn off at {time}")
            }
        };
        drop(core);

        self.inner.shared.write().await.record_settings(reply.clone());
        info!("{reply}");
        Ok(Reply::Text(reply))
    }

    /// Put file, memory and schedule back to `times` after a replace that
    /// could not be installed. Failures here are logged; there is nothing
    /// further to fall back to.
    async fn restore_sprinkler_times(&self, core: &mut Core, times: Vec<TimeOfDay>) {
        if let Err(e) = core
            .settings
            .update(|s| s.sprinkler_times = times.clone())
            .await
        {
            error!("failed to restore sprinkler times in settings: {e:#}");
        }
        let jobs = match times
            .iter()
            .map(|t| self.daily_job(*t, JobAction::Sprinkle))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("failed to rebuild sprinkler jobs: {e}");
                return;
            }
        };
        if let Err(e) = core.registry.replace_sprinkler_jobs(jobs).await {
            error!("failed to reinstall previous sprinkler jobs: {e}");
        }
    }

    /// The settings file exactly as stored, including keys the controller
    /// does not manage.
    pub async fn persisted_settings(&self) -> Result<Value> {
        let path = self.inner.core.lock().await.settings.path().to_path_buf();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn schedule_snapshot(&self) -> RegistrySnapshot {
        self.inner.core.lock().await.registry.snapshot()
    }

    pub async fn status(&self) -> StatusResponse {
        let (settings, schedules) = {
            let core = self.inner.core.lock().await;
            (core.settings.get().clone(), core.registry.snapshot())
        };
        self.inner.shared.read().await.to_status(settings, schedules)
    }

    pub async fn relay_on(&self) -> bool {
        let core = self.inner.core.lock().await;
        core.relay.as_ref().is_some_and(SprinklerRelay::is_on)
    }
}

fn light_message(on: bool) -> &'static str {
    if on {
        MSG_LIGHT_ON
    } else {
        MSG_LIGHT_OFF
    }
}

fn minute_of_day_now() -> u16 {
    let now = Local::now();
    (now.hour() * 60 + now.minute()) as u16
}

// ===========================================================================
// Test support
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
pub(crate) mod testing {
    use super::*;
    use crate::notifier::Outbound;
    use crate::settings::tests::{sample_settings_json, write_settings};
    use crate::state::SystemState;
    use std::path::{Path, PathBuf};
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) const SENSOR_23_5: &str =
        "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=23500\n";
    pub(crate) const SENSOR_NOT_READY: &str =
        "72 01 4b 46 7f ff 0e 10 57 : crc=57 NO\n72 01 4b 46 7f ff 0e 10 57 t=23500\n";

    pub(crate) struct Harness {
        pub controller: Controller,
        pub outbound: UnboundedReceiver<Outbound>,
        pub settings_path: PathBuf,
        pub inside_sensor: PathBuf,
    }

    impl Harness {
        /// Drain everything published so far.
        pub fn published(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(msg) = self.outbound.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    /// A controller over temp files with its schedules installed but the
    /// scheduler not started. `light_url` usually points at a wiremock server.
    pub(crate) async fn harness(dir: &Path, settings: Value, light_url: &str) -> Harness {
        let settings_path = write_settings(dir, &settings);
        let inside_sensor = dir.join("inside_w1_slave");
        let outside_sensor = dir.join("outside_w1_slave");
        std::fs::write(&inside_sensor, SENSOR_23_5).unwrap();
        std::fs::write(&outside_sensor, SENSOR_23_5).unwrap();

        let (notifier, outbound) = Notifier::new("Terrarium");
        let controller = Controller::new(ControllerParts {
            settings: SettingsStore::load(&settings_path).await.unwrap(),
            relay: SprinklerRelay::new(4, false).unwrap(),
            scheduler: JobScheduler::new().await.unwrap(),
            light: LightClient::new(light_url, Duration::from_secs(1)).unwrap(),
            notifier,
            shared: SystemState::shared(),
            topics: Topics::default(),
            sensors: SensorPaths {
                inside: inside_sensor.clone(),
                outside: outside_sensor,
            },
            brightness: 255,
        });
        controller.install_schedules().await.unwrap();

        Harness {
            controller,
            outbound,
            settings_path,
            inside_sensor,
        }
    }

    pub(crate) async fn default_harness(dir: &Path, light_url: &str) -> Harness {
        harness(dir, sample_settings_json(), light_url).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::settings::tests::sample_settings_json;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn light_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/json/state"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    fn light_url(server: &MockServer) -> String {
        format!("{}/json/state", server.uri())
    }

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn with_duration(ms: u64) -> Value {
        let mut v = sample_settings_json();
        v["sprinkleDurationMs"] = json!(ms);
        v
    }

    fn messages(h: &mut Harness, topic: &str) -> Vec<Value> {
        h.published()
            .into_iter()
            .filter(|o| o.topic == topic)
            .map(|o| o.payload["message"].clone())
            .collect()
    }

    // -- startup --------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread")]
    async fn install_builds_every_category() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;

        let snap = h.controller.schedule_snapshot().await;
        assert_eq!(snap.sprinkler_jobs.len(), 2);
        assert!(snap.light_start.is_some());
        assert!(snap.light_end.is_some());
        assert!(snap.color_update.is_some());
        assert!(snap.temperature_poll.is_some());
    }

    // -- sprinkler ------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread")]
    async fn sprinkler_on_turns_itself_off() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let mut h = harness(dir.path(), with_duration(80), &light_url(&server)).await;

        let reply = h.controller.sprinkler_command(SprinklerCommand::On).await.unwrap();
        assert_eq!(reply, Reply::Text("Start sprinkling".into()));
        assert!(h.controller.relay_on().await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!h.controller.relay_on().await);
        assert_eq!(
            messages(&mut h, "terrarium/regenanlage"),
            vec![json!("Stop sprinkling")]
        );
        assert!(h.controller.schedule_snapshot().await.pending_turn_off.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_flight_cycle_keeps_duration_from_activation() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = harness(dir.path(), with_duration(100), &light_url(&server)).await;

        h.controller.sprinkler_command(SprinklerCommand::On).await.unwrap();
        h.controller
            .settings_command(SettingsCommand::SetSprinkleDurationMs(60_000))
            .await
            .unwrap();

        let pending = h.controller.schedule_snapshot().await.pending_turn_off.unwrap();
        assert_eq!(pending.duration_ms, 100);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!h.controller.relay_on().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_cycles_extend_watering() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = harness(dir.path(), with_duration(300), &light_url(&server)).await;

        h.controller.sprinkler_command(SprinklerCommand::On).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.controller.sprinkler_command(SprinklerCommand::On).await.unwrap();

        // First cycle's deadline has passed, second one still running.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.controller.relay_on().await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!h.controller.relay_on().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_off_cancels_pending_turn_off() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let mut h = harness(dir.path(), with_duration(100), &light_url(&server)).await;

        h.controller.sprinkler_command(SprinklerCommand::On).await.unwrap();
        let reply = h.controller.sprinkler_command(SprinklerCommand::Off).await.unwrap();
        assert_eq!(reply, Reply::Text("Stop sprinkling".into()));
        assert!(!h.controller.relay_on().await);
        assert!(h.controller.schedule_snapshot().await.pending_turn_off.is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        // The timer was aborted, so it published nothing of its own.
        assert!(messages(&mut h, "terrarium/regenanlage").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduled_fire_notifies_start() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let mut h = harness(dir.path(), with_duration(60_000), &light_url(&server)).await;

        h.controller.run_job(JobAction::Sprinkle).await;
        assert!(h.controller.relay_on().await);
        assert_eq!(
            messages(&mut h, "terrarium/regenanlage"),
            vec![json!("Start sprinkling")]
        );
        h.controller.shutdown().await;
        assert!(!h.controller.relay_on().await);
    }

    // -- light ----------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread")]
    async fn light_command_posts_power_directive() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"on": false})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let h = default_harness(dir.path(), &light_url(&server)).await;

        let reply = h.controller.light_command(LightCommand::Off).await.unwrap();
        assert_eq!(reply, Reply::Text("Turning light off".into()));
        assert_eq!(h.controller.shared().read().await.light.on, Some(false));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn light_failure_is_actuator_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let h = default_harness(dir.path(), &light_url(&server)).await;

        let err = h.controller.light_command(LightCommand::On).await.unwrap_err();
        assert!(matches!(err, CommandError::ActuatorTransport(_)));
        assert!(!err.is_client_error());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduled_light_failure_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let mut h = default_harness(dir.path(), &light_url(&server)).await;

        h.controller.run_job(JobAction::Light(true)).await;
        let msgs = messages(&mut h, "terrarium/licht");
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].as_str().unwrap().contains("Light controller unreachable"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn color_update_sends_temperature_color() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;

        h.controller.update_light_color().await;

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
        assert_eq!(body["bri"], json!(255));
        // 23.5 rounds to 24
        assert_eq!(body["seg"], json!([{"col": [[255, 214, 0]]}]));
        assert!(body["on"].is_boolean());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn color_update_without_sensor_still_sends_power() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let mut h = default_harness(dir.path(), &light_url(&server)).await;
        std::fs::write(&h.inside_sensor, SENSOR_NOT_READY).unwrap();

        h.controller.update_light_color().await;

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
        assert!(body.get("seg").is_none());
        assert_eq!(body["bri"], json!(255));

        let errs = messages(&mut h, "terrarium/temperatur/innen");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].as_str().unwrap().contains("sensor not ready"));
    }

    // -- temperature ----------------------------------------------------------

    #[tokio::test(flavor = "multi_thread")]
    async fn temperature_query_updates_gauge() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;

        let reply = h.controller.read_temperature(Location::Inside).await.unwrap();
        assert_eq!(reply, Reply::Temperature(23.5));
        let metrics = h.controller.shared().read().await.render_metrics();
        assert!(metrics.contains("inside_temperature_celsius 23.5"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn poll_reports_each_failed_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let mut h = default_harness(dir.path(), &light_url(&server)).await;
        std::fs::remove_file(&h.inside_sensor).unwrap();

        h.controller.poll_temperatures().await;

        assert_eq!(messages(&mut h, "terrarium/temperatur/innen").len(), 1);
        let st = h.controller.shared().read().await;
        assert!(st.temperatures.inside.is_none());
        assert_eq!(st.temperatures.outside.map(|r| r.celsius), Some(23.5));
    }

    // -- settings -------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread")]
    async fn set_sprinkler_times_replaces_jobs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;
        let before = h.controller.schedule_snapshot().await.sprinkler_jobs;

        let reply = h
            .controller
            .settings_command(SettingsCommand::SetSprinklerTimes(vec![
                t("06:00"),
                t("12:00"),
                t("18:00"),
            ]))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("Successfully set new times".into()));

        let after = h.controller.schedule_snapshot().await.sprinkler_jobs;
        assert_eq!(after.len(), 3);
        assert!(before.iter().all(|id| !after.contains(id)));

        let on_disk = h.controller.persisted_settings().await.unwrap();
        assert_eq!(on_disk["sprinklerTimes"], json!(["06:00", "12:00", "18:00"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_light_start_swaps_singleton() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;
        let before = h.controller.schedule_snapshot().await;

        let reply = h
            .controller
            .settings_command(SettingsCommand::SetLightStart(t("07:30")))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("Light will turn on at 07:30".into()));

        let after = h.controller.schedule_snapshot().await;
        assert_ne!(before.light_start, after.light_start);
        assert_eq!(before.light_end, after.light_end);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duration_message_uses_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;

        let reply = h
            .controller
            .settings_command(SettingsCommand::SetSprinkleDurationMs(1500))
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Text("Sprinkler now will sprinkle 1.5 seconds.".into())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_settings_returns_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;

        h.controller
            .settings_command(SettingsCommand::SetLightEnd(t("22:15")))
            .await
            .unwrap();
        let Reply::Settings(s) = h
            .controller
            .settings_command(SettingsCommand::GetSettings)
            .await
            .unwrap()
        else {
            panic!("expected settings reply");
        };
        assert_eq!(s.sprinkler_times.len(), 2);
        assert_eq!(s.sprinkle_duration_ms, 15000);
        assert_eq!(s.light_start, t("07:00"));
        assert_eq!(s.light_end, t("22:15"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restore_sprinkler_times_rewinds_file_and_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;
        let previous = h.controller.inner.core.lock().await.settings.get().sprinkler_times.clone();

        h.controller
            .settings_command(SettingsCommand::SetSprinklerTimes(vec![
                t("05:00"),
                t("11:00"),
                t("17:00"),
            ]))
            .await
            .unwrap();

        {
            let mut core = h.controller.inner.core.lock().await;
            h.controller.restore_sprinkler_times(&mut core, previous).await;
            assert_eq!(core.settings.get().sprinkler_times, vec![t("08:00"), t("20:00")]);
        }
        assert_eq!(h.controller.schedule_snapshot().await.sprinkler_jobs.len(), 2);
        let on_disk = h.controller.persisted_settings().await.unwrap();
        assert_eq!(on_disk["sprinklerTimes"], json!(["08:00", "20:00"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_persist_leaves_schedule_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let server = light_server().await;
        let h = default_harness(dir.path(), &light_url(&server)).await;
        let before = h.controller.schedule_snapshot().await;

        std::fs::remove_file(dir.path().join("config.json")).unwrap();
        let err = h
            .controller
            .settings_command(SettingsCommand::SetLightStart(t("09:00")))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Persistence(_)));

        let after = h.controller.schedule_snapshot().await;
        assert_eq!(before.light_start, after.light_start);
    }
}

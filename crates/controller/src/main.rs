mod command;
mod config;
mod controller;
mod dispatch;
mod error;
mod light;
mod notifier;
mod registry;
mod relay;
mod sensor;
mod settings;
mod state;
mod validate;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_cron_scheduler::JobScheduler;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use controller::{Controller, ControllerParts};
use dispatch::Dispatcher;
use light::LightClient;
use notifier::Notifier;
use relay::SprinklerRelay;
use settings::SettingsStore;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tokio_cron_scheduler=warn")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "terrarium.toml".to_string());
    let cfg = config::load(&config_path)?;

    let settings = SettingsStore::load(&cfg.settings.path).await?;

    // ── Devices ─────────────────────────────────────────────────────
    let relay = SprinklerRelay::new(cfg.relay_pin(), cfg.relay.active_low)?;
    let light = LightClient::new(cfg.light.url.clone(), cfg.light.timeout())
        .context("failed to build light client")?;
    info!(url = light.url(), "light controller configured");

    // ── Shared state (ephemeral, for the status board) ──────────────
    let shared = SystemState::shared();

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let (notifier, outbound) = Notifier::new(cfg.mqtt.sender.clone());
    tokio::spawn(notifier::pump(outbound, client.clone()));

    // ── Controller ──────────────────────────────────────────────────
    let scheduler = JobScheduler::new()
        .await
        .context("failed to create job scheduler")?;
    let controller = Controller::new(ControllerParts {
        settings,
        relay,
        scheduler,
        light,
        notifier,
        shared: shared.clone(),
        topics: cfg.topics.clone(),
        sensors: cfg.sensors.paths(),
        brightness: cfg.light.brightness,
    });
    controller.start().await?;
    let dispatcher = Dispatcher::new(controller.clone());

    // Inbound publishes are handled by a single worker, in arrival order.
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
    tokio::spawn(dispatcher.clone().run(inbound_rx));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        dispatcher: dispatcher.clone(),
    };
    let bind = cfg.web.bind.clone();
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, &bind, web_port).await {
            error!("{e:#}");
        }
    });

    info!(
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        "connecting to mqtt broker"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminate received");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if inbound_tx.send((p.topic, p.payload.to_vec())).is_err() {
                        error!("inbound worker stopped, dropping publish");
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    for topic in cfg.topics.all() {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            warn!(topic, "subscribe failed: {e}");
                        }
                    }
                    debug!(topics = ?cfg.topics.all(), "subscribed");
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. reconnecting...");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                    drop(st);

                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    drop(inbound_tx);
    controller.shutdown().await;
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {e}");
    }
    // Drive the event loop until the queued publishes and the disconnect are out.
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;
    info!("bye");
    Ok(())
}

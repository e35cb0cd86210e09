mod command;
mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use command::parse_command;
use sim::{Scenario, StationSim, Tick};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemStatus<'a> {
    device: &'a str,
    status: &'a str,
    last_seen: i64,
}

/// Topic names for one station, mirroring the dashboard's layout.
struct Topics {
    sensors: String,
    pump_status: String,
    system_status: String,
    logs: String,
    pump_command: String,
}

impl Topics {
    fn new(prefix: &str) -> Self {
        Self {
            sensors: format!("{prefix}/sensors"),
            pump_status: format!("{prefix}/pump/status"),
            system_status: format!("{prefix}/system/status"),
            logs: format!("{prefix}/logs"),
            pump_command: format!("{prefix}/pump/command"),
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn status_payload(device: &str, status: &str) -> Vec<u8> {
    serde_json::to_vec(&SystemStatus {
        device,
        status,
        last_seen: now_unix(),
    })
    .unwrap_or_default()
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device = env::var("DEVICE_ID").unwrap_or_else(|_| "agrohygra-01".to_string());
    let prefix = env::var("TOPIC_PREFIX").unwrap_or_else(|_| "agrohygra".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let diurnal_period_s: f64 = env::var("SIM_DAY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);

    let topics = Topics::new(&prefix);
    let client_id = format!("agrohygra-node-{device}");

    let mut mqttoptions = MqttOptions::new(client_id, broker.clone(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_last_will(LastWill::new(
        topics.system_status.clone(),
        status_payload(&device, "offline"),
        QoS::AtMostOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<bool>(16);

    info!(%broker, port, %device, %scenario, sample_every_s, "station simulator starting");

    // Event loop: announce presence and subscribe on every (re)connect,
    // forward pump commands to the sampling loop.
    {
        let client = client.clone();
        let device = device.clone();
        let system_status = topics.system_status.clone();
        let command_topic = topics.pump_command.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to mqtt");
                        if let Err(e) = client.try_subscribe(command_topic.as_str(), QoS::AtMostOnce) {
                            warn!("subscribe failed: {e}");
                        }
                        if let Err(e) = client.try_publish(
                            system_status.as_str(),
                            QoS::AtMostOnce,
                            true,
                            status_payload(&device, "online"),
                        ) {
                            warn!("status publish failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == command_topic => {
                        match parse_command(&p.payload) {
                            Ok(on) => {
                                if cmd_tx.send(on).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("{e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. retrying...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let mut sim = StationSim::new(scenario, diurnal_period_s);
    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if sim.step(sample_every_s as f64) == Tick::AutoOff {
                    info!("soil saturated, pump stopped");
                    publish_log(&client, &topics, "Soil saturated, pump auto-off").await;
                    publish_pump(&client, &topics, false).await;
                }

                let msg = sim.telemetry(&device, now_unix());
                let payload = serde_json::to_vec(&msg)?;
                if let Err(e) = client
                    .publish(topics.sensors.as_str(), QoS::AtMostOnce, false, payload)
                    .await
                {
                    warn!("publish error: {e}");
                } else {
                    info!(soil = msg.soil, pump = msg.pump, "published reading");
                }
            }
            Some(on) = cmd_rx.recv() => {
                if sim.set_pump(on) {
                    info!(on, "pump switched by command");
                    publish_log(
                        &client,
                        &topics,
                        &format!("Pump {} by remote command (activations: {})", on_off(on), sim.count()),
                    )
                    .await;
                }
                publish_pump(&client, &topics, sim.pump()).await;
            }
        }
    }
}

async fn publish_pump(client: &AsyncClient, topics: &Topics, on: bool) {
    if let Err(e) = client
        .publish(topics.pump_status.as_str(), QoS::AtMostOnce, false, on_off(on))
        .await
    {
        warn!("pump status publish failed: {e}");
    }
}

async fn publish_log(client: &AsyncClient, topics: &Topics, line: &str) {
    if let Err(e) = client
        .publish(topics.logs.as_str(), QoS::AtMostOnce, false, line.to_string())
        .await
    {
        warn!("log publish failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

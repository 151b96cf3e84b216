//! Care sensor simulator
//!
//! Publishes scenario readings in the device firmware's JSON shape so the
//! gateway can be exercised locally. Optionally watches the gateway's alert
//! feed and prints what comes back.
//!
//! Usage:
//!   cargo run --bin care-sim -- --list
//!   cargo run --bin care-sim -- --scenario fall,high_temp --device pochi-01
//!   cargo run --bin care-sim -- --scenario all --watch

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::time::Duration;

const DATA_TOPIC: &str = "care/sensor/data";
const ALERT_TOPIC: &str = "care/alert";
const STATUS_TOPIC: &str = "care/status";
const LOCATION_TOPIC: &str = "care/location";
const REGISTER_TOPIC: &str = "care/recipients/register";
const ALERT_FEED_TOPIC: &str = "care/out/alerts";

#[derive(Parser, Debug)]
#[command(name = "care-sim")]
#[command(about = "Care sensor simulator - publishes scenario readings over MQTT")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Device id used in published payloads
    #[arg(short, long, default_value = "sim-01")]
    device: String,

    /// Facility id attached to payloads
    #[arg(short, long)]
    facility: Option<String>,

    /// Scenarios to run, comma separated, or "all"
    #[arg(short, long, default_value = "all")]
    scenario: String,

    /// Print available scenarios and exit
    #[arg(short, long)]
    list: bool,

    /// Subscribe to the alert feed and print alerts
    #[arg(short, long)]
    watch: bool,

    /// Register a push-message recipient with this address before running
    #[arg(long)]
    register: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ReadingPlan {
    temperature: Option<f64>,
    humidity: Option<f64>,
    distance: Option<f64>,
    zone: Option<&'static str>,
    motion: Option<bool>,
    fall: bool,
}

const CALM: ReadingPlan = ReadingPlan {
    temperature: Some(24.0),
    humidity: Some(45.0),
    distance: Some(600.0),
    zone: Some("NEAR"),
    motion: Some(true),
    fall: false,
};

#[derive(Debug, Clone, Copy)]
enum Step {
    Reading(ReadingPlan),
    DeviceAlert { level: u8, kind: &'static str, message: &'static str },
    Status(&'static str),
    Location { latitude: f64, longitude: f64 },
    Wait(u64),
}

struct Scenario {
    name: &'static str,
    description: &'static str,
    steps: &'static [Step],
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "calm",
        description: "Normal readings, no alerts expected",
        steps: &[Step::Reading(CALM), Step::Wait(500), Step::Reading(CALM)],
    },
    Scenario {
        name: "fall",
        description: "IMU fall flag - level 3 fall alert",
        steps: &[
            Step::Location { latitude: 35.6762, longitude: 139.6503 },
            Step::Reading(CALM),
            Step::Reading(ReadingPlan { fall: true, motion: Some(false), ..CALM }),
        ],
    },
    Scenario {
        name: "high_temp",
        description: "36.2°C - level 2 high temperature alert",
        steps: &[Step::Reading(ReadingPlan { temperature: Some(36.2), ..CALM })],
    },
    Scenario {
        name: "cold_and_humid",
        description: "Low temperature and high humidity in one reading",
        steps: &[Step::Reading(ReadingPlan {
            temperature: Some(12.0),
            humidity: Some(85.0),
            ..CALM
        })],
    },
    Scenario {
        name: "bed_exit",
        description: "ToF zone moves to FAR - level 2 bed exit alert",
        steps: &[
            Step::Reading(CALM),
            Step::Reading(ReadingPlan { zone: Some("FAR"), distance: Some(1500.0), ..CALM }),
        ],
    },
    Scenario {
        name: "sudden_drop",
        description: "Distance collapses to near zero - composite anomaly",
        steps: &[
            Step::Reading(ReadingPlan { distance: Some(400.0), ..CALM }),
            Step::Reading(ReadingPlan { distance: Some(20.0), ..CALM }),
        ],
    },
    Scenario {
        name: "rate_limit",
        description: "Five hot readings - the fourth and fifth are suppressed",
        steps: &[
            Step::Reading(ReadingPlan { temperature: Some(36.5), ..CALM }),
            Step::Reading(ReadingPlan { temperature: Some(36.6), ..CALM }),
            Step::Reading(ReadingPlan { temperature: Some(36.7), ..CALM }),
            Step::Reading(ReadingPlan { temperature: Some(36.8), ..CALM }),
            Step::Reading(ReadingPlan { temperature: Some(36.9), ..CALM }),
        ],
    },
    Scenario {
        name: "device_sos",
        description: "Device-classified SOS alert with status change",
        steps: &[
            Step::Status("online"),
            Step::DeviceAlert { level: 3, kind: "sos", message: "SOS button pressed" },
            Step::Status("battery-low"),
        ],
    },
];

fn get_scenario(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn reading_payload(device: &str, facility: Option<&str>, spec: &ReadingPlan) -> Value {
    let mut payload = json!({
        "device_id": device,
        "timestamp": Utc::now().timestamp_millis(),
        "imu": { "fall_detected": spec.fall },
        "tof": { "distance": spec.distance, "zone": spec.zone },
        "environment": { "temperature": spec.temperature, "humidity": spec.humidity },
        "battery": 87.0,
    });
    if let Some(motion) = spec.motion {
        payload["motion"] = json!(motion);
    }
    if let Some(facility) = facility {
        payload["facility_id"] = json!(facility);
    }
    payload
}

fn step_message(device: &str, facility: Option<&str>, step: &Step) -> Option<(&'static str, Value)> {
    let with_facility = |mut v: Value| {
        if let Some(f) = facility {
            v["facility_id"] = json!(f);
        }
        v
    };
    match *step {
        Step::Reading(ref spec) => Some((DATA_TOPIC, reading_payload(device, facility, spec))),
        Step::DeviceAlert { level, kind, message } => Some((
            ALERT_TOPIC,
            with_facility(json!({
                "device_id": device,
                "level": level,
                "type": kind,
                "message": message,
                "timestamp": Utc::now().timestamp_millis(),
            })),
        )),
        Step::Status(status) => Some((
            STATUS_TOPIC,
            with_facility(json!({ "device_id": device, "status": status, "battery": 55.0 })),
        )),
        Step::Location { latitude, longitude } => Some((
            LOCATION_TOPIC,
            with_facility(json!({
                "device_id": device,
                "latitude": latitude,
                "longitude": longitude,
                "satellites": 8,
            })),
        )),
        Step::Wait(_) => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.list {
        for s in SCENARIOS {
            println!("{:<16} {}", s.name, s.description);
        }
        return Ok(());
    }

    let names: Vec<&str> = if args.scenario == "all" {
        SCENARIOS.iter().map(|s| s.name).collect()
    } else {
        args.scenario.split(',').map(str::trim).collect()
    };
    let mut scenarios = Vec::with_capacity(names.len());
    for name in names {
        match get_scenario(name) {
            Some(s) => scenarios.push(s),
            None => {
                eprintln!("Unknown scenario: {name}");
                std::process::exit(2);
            }
        }
    }

    let mut mqtt_options =
        MqttOptions::new(format!("care-sim-{}", std::process::id()), &args.host, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    if args.watch {
        client.subscribe(ALERT_FEED_TOPIC, QoS::AtLeastOnce).await?;
    }

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => println!("[MQTT] connected"),
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    let body = String::from_utf8_lossy(&publish.payload);
                    match serde_json::from_str::<Value>(&body) {
                        Ok(v) => println!(
                            "[ALERT] level={} kind={} device={} {}",
                            v["level"], v["kind"], v["device_id"], v["message"]
                        ),
                        Err(_) => println!("[FEED] {} {}", publish.topic, body),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[MQTT] error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let facility = args.facility.as_deref();

    if let Some(ref address) = args.register {
        let mut reg = json!({
            "recipient_id": address,
            "channel": "push-message",
            "address": address,
        });
        if let Some(f) = facility {
            reg["facility_id"] = json!(f);
        }
        client.publish(REGISTER_TOPIC, QoS::AtLeastOnce, false, reg.to_string()).await?;
        println!("[SETUP] registered recipient {address}");
    }

    for scenario in scenarios {
        println!("Running: {} - {}", scenario.name, scenario.description);
        for step in scenario.steps {
            if let Step::Wait(ms) = step {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                continue;
            }
            if let Some((topic, payload)) = step_message(&args.device, facility, step) {
                client.publish(topic, QoS::AtLeastOnce, false, payload.to_string()).await?;
                println!("  -> {topic} {payload}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // Leave time for the alert feed to come back
    let linger = if args.watch { Duration::from_secs(3) } else { Duration::from_millis(500) };
    tokio::time::sleep(linger).await;
    client.disconnect().await.ok();
    Ok(())
}

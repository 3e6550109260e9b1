use abb2mqtt::health::run_watchdog;
use abb2mqtt::{Config, HealthState, MbusManager, MqttManager};
use log::{error, info};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("A2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = Config::load();

    let connected = Arc::new(AtomicBool::new(false));
    let health = Arc::new(HealthState::new());
    let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel(2);

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    // MQTT side first, its eventloop task starts inside new()
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt, connected.clone());
    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    // Polling supervisor
    let mut mbus = MbusManager::new(config.meter.clone(), tx, health.clone(), fatal_tx.clone());
    threads.push(tokio::spawn(async move {
        mbus.start_thread().await;
    }));

    // Watchdog, independent of the polling loop
    let max_staleness = Duration::from_secs(config.meter.max_staleness);
    threads.push(tokio::spawn(run_watchdog(health, max_staleness, fatal_tx)));

    info!("All modules started, now waiting for a fatal signal");
    let reason = fatal_rx.recv().await;

    for task in threads.iter() {
        task.abort();
    }

    match reason {
        Some(reason) => {
            error!("Fatal: {reason}. Exiting so the supervisor restarts us");
        }
        None => {
            error!("All fatal senders gone without a signal, exiting");
        }
    }
    return ExitCode::FAILURE;
}

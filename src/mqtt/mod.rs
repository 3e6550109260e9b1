use crate::config::MqttConfig;
use crate::models::MeasurementSet;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::sleep;

/// How long a publish waits for the event loop to bring the session back
/// before this cycle's message is dropped. There is no outbound queue.
const RECONNECT_GRACE: Duration = Duration::from_secs(5);
/// Backoff between event loop polls after a connection error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct MqttManager {
    rx: Receiver<MeasurementSet>,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topic: String,
    grace: Duration,
}

impl MqttManager {
    /// Builds the client and spawns the event loop task. The event loop
    /// owns the connectivity flag: ConnAck with a success code sets it,
    /// everything that drops the session clears it.
    pub fn new(config: &MqttConfig, connected: Arc<AtomicBool>) -> (Self, Sender<MeasurementSet>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(16);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(config.user.clone(), config.pass.clone());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        let flag = connected.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("Connected to MQTT Broker");
                            flag.store(true, Ordering::SeqCst);
                        } else {
                            error!("Failed to connect to MQTT Broker. Return code: {:?}", ack.code);
                            flag.store(false, Ordering::SeqCst);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Disconnected from MQTT Broker: {e}");
                        flag.store(false, Ordering::SeqCst);
                        sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        });

        let manager = MqttManager {
            rx: mrx,
            client,
            connected,
            topic: config.topic.clone(),
            grace: RECONNECT_GRACE,
        };
        return (manager, mtx);
    }

    /// Receives one measurement set per polling cycle and publishes it.
    pub async fn start_thread(&mut self) {
        while let Some(set) = self.rx.recv().await {
            self.publish(&set).await;
        }

        info!("Metering channel closed, MQTT thread exiting");
    }

    /// Best effort delivery as a retained message. When the session is down
    /// the grace period gives the event loop a chance to reconnect, after
    /// that the set is dropped. Failures here never count as acquisition
    /// failures.
    async fn publish(&self, set: &MeasurementSet) {
        if !self.connected.load(Ordering::SeqCst) {
            warn!("MQTT not connected. Waiting {}s for the session to come back", self.grace.as_secs());
            sleep(self.grace).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            error!("Failed to publish data: MQTT not connected");
            return;
        }

        debug!("Publishing {} measurements to {}", set.len(), self.topic);
        let payload = set.to_payload().to_string();
        match self.client.publish(self.topic.clone(), QoS::AtLeastOnce, true, payload).await {
            Ok(_) => debug!("Published successfully"),
            Err(e) => error!("Error publishing: {e}"),
        }
    }
}

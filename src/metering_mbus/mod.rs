use crate::config::MeterConfig;
use crate::health::{FatalReason, HealthState};
use crate::models::MeasurementSet;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;

pub mod decode;
pub mod transport;

use decode::{decode_telegram1, decode_telegram2, TelegramError};
use transport::{MbusTransport, REQ_UD1, REQ_UD2};

/// Settle delays between request and read. The meter needs time to put its
/// response together and the line has no frame ready signal.
const SETTLE_TELEGRAM1: Duration = Duration::from_secs(1);
const SETTLE_TELEGRAM2: Duration = Duration::from_secs(2);
/// How long a response may take to start arriving once requested.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);
/// Consecutive failed cycles before we give up and ask for a restart.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Custom error types for the acquisition side. The supervisor treats them
/// all the same, the distinction only matters for the log.
#[derive(Error, Debug)]
pub enum MbusError {
    #[error("Timed out waiting for the meter to respond")]
    Timeout,
    #[error("Serial port error: {0}")]
    Io(String),
    #[error(transparent)]
    Telegram(#[from] TelegramError),
}

/// Counts consecutive failed acquisition cycles. `record_failure` reports
/// true exactly when the threshold is crossed, not on later failures.
pub struct FailureCounter {
    consecutive: u32,
    threshold: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        return FailureCounter { consecutive: 0, threshold };
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        return self.consecutive == self.threshold;
    }

    pub fn count(&self) -> u32 {
        return self.consecutive;
    }
}

pub struct MbusManager {
    config: MeterConfig,
    sender: Sender<MeasurementSet>,
    health: Arc<HealthState>,
    fatal: Sender<FatalReason>,
}

impl MbusManager {
    pub fn new(
        config: MeterConfig,
        sender: Sender<MeasurementSet>,
        health: Arc<HealthState>,
        fatal: Sender<FatalReason>,
    ) -> Self {
        return MbusManager { config, sender, health, fatal };
    }

    /// Polling supervisor: one acquisition cycle per interval, counting
    /// consecutive failures until the restart threshold.
    pub async fn start_thread(&mut self) {
        info!("Starting M-Bus polling, meter {} on {}", self.config.address, self.config.device);
        let interval = Duration::from_secs(self.config.polling_interval);
        let mut failures = FailureCounter::new(MAX_CONSECUTIVE_FAILURES);

        loop {
            debug!("Polling data from the meter");
            match self.acquire().await {
                Ok(set) => {
                    debug!("Acquired {} measurements", set.len());
                    self.health.mark_success();
                    failures.record_success();
                    let _ = self.sender.send(set).await;
                }
                Err(e) => {
                    error!("Error fetching data from meter: {e}");
                    if failures.record_failure() {
                        error!("Failed to fetch data {} times in a row, requesting restart", failures.count());
                        let _ = self.fatal.send(FatalReason::AcquisitionFailures(failures.count())).await;
                        return;
                    }
                }
            }

            sleep(interval).await;
        }
    }

    /// One two-step acquisition cycle. Telegram 1 must fully complete
    /// before telegram 2 is requested, the bus is half duplex.
    async fn acquire(&mut self) -> Result<MeasurementSet, MbusError> {
        let mut transport = MbusTransport::connect(&self.config.device, self.config.baudrate).await?;

        transport.send_request(self.config.address, REQ_UD1).await?;
        sleep(SETTLE_TELEGRAM1).await;
        let frame = transport.receive_frame(RECV_TIMEOUT).await?;
        let mut set = decode_telegram1(&frame, self.config.encoding)?;

        transport.send_request(self.config.address, REQ_UD2).await?;
        sleep(SETTLE_TELEGRAM2).await;
        let frame = transport.receive_frame(RECV_TIMEOUT).await?;
        set.merge(decode_telegram2(&frame, self.config.encoding)?);

        return Ok(set);
    }
}

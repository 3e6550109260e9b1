use log::{error, info};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;

/// How often the watchdog compares the last success against the limit.
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Why the process is asking its outer supervisor for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    AcquisitionFailures(u32),
    DataStale(Duration),
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalReason::AcquisitionFailures(count) => {
                write!(f, "{count} consecutive acquisition failures")
            }
            FatalReason::DataStale(age) => {
                write!(f, "no successful read for {}s", age.as_secs())
            }
        }
    }
}

/// Instant of the last successful acquisition. Written by the polling side
/// on success, read by the watchdog. Starts at process start so a fresh
/// process gets the full staleness budget before the first check can fire.
pub struct HealthState {
    last_success: Mutex<Instant>,
}

impl HealthState {
    pub fn new() -> Self {
        return HealthState { last_success: Mutex::new(Instant::now()) };
    }

    pub fn mark_success(&self) {
        *self.last_success.lock().unwrap() = Instant::now();
    }

    /// Time since the last successful acquisition.
    pub fn staleness(&self) -> Duration {
        return self.last_success.lock().unwrap().elapsed();
    }
}

impl Default for HealthState {
    fn default() -> Self {
        return HealthState::new();
    }
}

/// One watchdog tick: the age of the data if it exceeds the limit.
fn check_staleness(health: &HealthState, max_staleness: Duration) -> Option<Duration> {
    let age = health.staleness();
    if age > max_staleness {
        return Some(age);
    }
    return None;
}

/// Liveness monitor. Fires the fatal signal once the data gets older than
/// the configured maximum and never recovers afterwards.
pub async fn run_watchdog(health: Arc<HealthState>, max_staleness: Duration, fatal: Sender<FatalReason>) {
    info!("Watchdog armed, maximum staleness {}s", max_staleness.as_secs());

    loop {
        sleep(CHECK_INTERVAL).await;
        if let Some(age) = check_staleness(&health, max_staleness) {
            error!("No data received for {}s, requesting restart", age.as_secs());
            let _ = fatal.send(FatalReason::DataStale(age)).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_staleness_grows_until_marked() {
        let health = HealthState::new();
        thread::sleep(Duration::from_millis(30));
        assert!(health.staleness() >= Duration::from_millis(30));

        health.mark_success();
        assert!(health.staleness() < Duration::from_millis(30));
    }

    #[test]
    fn test_check_fires_only_beyond_threshold() {
        let health = HealthState::new();
        thread::sleep(Duration::from_millis(30));

        assert!(check_staleness(&health, Duration::from_secs(300)).is_none());
        let age = check_staleness(&health, Duration::from_millis(10));
        assert!(age.is_some());
        assert!(age.unwrap() >= Duration::from_millis(30));
    }

    #[test]
    fn test_fresh_mark_clears_staleness() {
        let health = HealthState::new();
        thread::sleep(Duration::from_millis(30));
        health.mark_success();
        assert!(check_staleness(&health, Duration::from_millis(10)).is_none());
    }
}

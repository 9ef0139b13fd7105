//! # Connection Supervisor Module
//!
//! Keeps a `DataSource` streaming into the ring buffer across failures.
//!
//! ## Retry policy
//! - Up to `max_attempts` consecutive failed attempts (default 5)
//! - Exponential backoff between attempts: 3 s, 4.5 s, 6.75 s, ...
//! - A session that delivers at least one record resets the counter, so a
//!   sensor that drops out now and then is reconnected indefinitely
//!
//! The stop flag is honored between attempts, while streaming and during
//! backoff. An attempt in progress is never cancelled: `start` runs to
//! completion and whatever it acquired is released through `stop`.

use crate::buffer::RingBuffer;
use crate::connection::ConnectionStatus;
use crate::error::ConnectionError;
use crate::session::{wait_for_stop, Ingest};
use crate::source::DataSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(3),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `failures`-th consecutive failure (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1) as i32;
        self.initial_delay.mul_f64(self.multiplier.powi(exponent))
    }
}

/// Coarse failure categories, used to tell the operator what to check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DeviceNotFound,
    ConnectionTimeout,
    Disconnected,
    Other,
}

impl FailureKind {
    pub fn classify(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::DeviceNotFound { .. } => FailureKind::DeviceNotFound,
            ConnectionError::ConnectTimeout { .. } => FailureKind::ConnectionTimeout,
            ConnectionError::ConnectionLost(_) => FailureKind::Disconnected,
            _ => FailureKind::Other,
        }
    }

    pub fn guidance(&self) -> &'static str {
        match self {
            FailureKind::DeviceNotFound => {
                "Device not found: check that it is powered on, advertising and in range"
            }
            FailureKind::ConnectionTimeout => {
                "Connection timed out: move closer to the device or restart it"
            }
            FailureKind::Disconnected => {
                "Connection dropped: check the device battery and signal strength"
            }
            FailureKind::Other => "Unexpected connection error: check Bluetooth adapter state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Stopped,
}

enum StreamOutcome {
    Stopped,
    Failed(ConnectionError),
}

pub struct ConnectionSupervisor {
    policy: RetryPolicy,
    buffer: Arc<RingBuffer>,
    stop: Arc<AtomicBool>,
}

impl ConnectionSupervisor {
    pub fn new(policy: RetryPolicy, buffer: Arc<RingBuffer>, stop: Arc<AtomicBool>) -> Self {
        Self {
            policy,
            buffer,
            stop,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Drive `source` until stopped or retries are exhausted.
    ///
    /// `on_status` sees every lifecycle change; the terminal error is also
    /// reported through it as `ConnectionStatus::Error`.
    pub async fn run<S, F>(
        &self,
        source: &mut S,
        mut on_status: F,
    ) -> Result<SupervisorExit, ConnectionError>
    where
        S: DataSource + ?Sized,
        F: FnMut(ConnectionStatus) + Send,
    {
        let max = self.policy.max_attempts;
        let mut failures = 0u32;

        loop {
            if self.stopped() {
                on_status(ConnectionStatus::Disconnected);
                return Ok(SupervisorExit::Stopped);
            }

            on_status(ConnectionStatus::Connecting);
            log::info!(
                "Starting {} data collection (attempt {}/{})",
                source.name(),
                failures + 1,
                max
            );

            let started = source.start().await;
            if self.stopped() {
                log::info!("Stop requested while connecting");
                source.stop().await;
                on_status(ConnectionStatus::Disconnected);
                return Ok(SupervisorExit::Stopped);
            }

            let error = match started {
                Ok(()) => {
                    on_status(ConnectionStatus::Connected);
                    let outcome = self.stream(source, &mut failures).await;
                    source.stop().await;
                    match outcome {
                        StreamOutcome::Stopped => {
                            log::info!("Data collection stopped");
                            on_status(ConnectionStatus::Disconnected);
                            return Ok(SupervisorExit::Stopped);
                        }
                        StreamOutcome::Failed(e) => e,
                    }
                }
                Err(e) => {
                    source.stop().await;
                    e
                }
            };

            failures += 1;
            let kind = FailureKind::classify(&error);
            log::error!("Data collection error (attempt {}/{}): {}", failures, max, error);
            log::warn!("{}", kind.guidance());

            if failures >= max {
                log::error!("Max retries ({}) exceeded. Giving up.", max);
                let exhausted = ConnectionError::RetriesExhausted {
                    attempts: failures,
                    last: Box::new(error),
                };
                on_status(ConnectionStatus::Error(exhausted.to_string()));
                return Err(exhausted);
            }

            on_status(ConnectionStatus::Disconnected);
            let delay = self.policy.delay_for(failures);
            log::info!("Retrying in {:.1} seconds...", delay.as_secs_f64());

            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = wait_for_stop(&self.stop) => true,
            };
            if interrupted {
                log::info!("Retry cancelled by stop request");
                return Ok(SupervisorExit::Stopped);
            }
        }
    }

    async fn stream<S>(&self, source: &mut S, failures: &mut u32) -> StreamOutcome
    where
        S: DataSource + ?Sized,
    {
        let mut received = 0u64;
        loop {
            let item = tokio::select! {
                item = source.next_record() => item,
                _ = wait_for_stop(&self.stop) => return StreamOutcome::Stopped,
            };

            match item {
                Ingest::Record(record) => {
                    self.buffer.append(record);
                    received += 1;
                    if received == 1 && *failures > 0 {
                        log::info!("Stream healthy again, retry counter reset");
                        *failures = 0;
                    }
                    if received % 250 == 0 {
                        let stats = self.buffer.stats();
                        log::debug!(
                            "Received {} records (buffer {}/{}, {:.1} Hz)",
                            received,
                            stats.fill_level,
                            self.buffer.capacity(),
                            stats.sample_rate_hz
                        );
                    }
                }
                Ingest::Skip => {}
                Ingest::Fatal(e) => return StreamOutcome::Failed(e),
            }
        }
    }
}

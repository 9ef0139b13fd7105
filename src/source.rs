//! # Data Source Module
//!
//! What the supervisor drives: something that can be started, yields records
//! one at a time, and can be stopped.
//!
//! - `BleSource`: scan, connect and stream from the real sensor
//! - `MockSource`: deterministic synthetic data at a fixed rate, for running
//!   the pipeline without hardware

use crate::ble::BleLink;
use crate::config::{Config, DeviceConfig, SourceKind};
use crate::device_scanner::resolve;
use crate::error::ConnectionError;
use crate::parser::parse_record;
use crate::session::{ConnectionSession, Ingest, SessionState};
use async_trait::async_trait;
use std::f64::consts::TAU;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish the stream. Called once per supervisor attempt.
    async fn start(&mut self) -> Result<(), ConnectionError>;

    /// Wait for the next ingestion step
    async fn next_record(&mut self) -> Ingest;

    /// Release everything `start` acquired. Safe to call when not started.
    async fn stop(&mut self);

    async fn is_connected(&self) -> bool;
}

/// Build the source selected in `config`
pub fn from_config(config: &Config) -> Box<dyn DataSource> {
    match config.source.kind {
        SourceKind::Ble => Box::new(BleSource::new(config.device.clone())),
        SourceKind::Mock => Box::new(MockSource::new(config.source.mock_rate_hz)),
    }
}

pub struct BleSource {
    settings: DeviceConfig,
    state: SessionState,
    session: Option<ConnectionSession<BleLink>>,
}

impl BleSource {
    pub fn new(settings: DeviceConfig) -> Self {
        Self {
            settings,
            state: SessionState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.session {
            Some(session) => session.state(),
            None => self.state,
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("Session state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn establish(&mut self) -> Result<ConnectionSession<BleLink>, ConnectionError> {
        self.transition(SessionState::Scanning);
        let device = resolve(&self.settings.criteria(), self.settings.scan_timeout()).await?;

        self.transition(SessionState::Connecting);
        let link = BleLink::connect(
            device,
            &self.settings.notify_uuid,
            self.settings.connect_timeout(),
        )
        .await?;

        ConnectionSession::open(link, self.settings.idle_timeout()).await
    }
}

#[async_trait]
impl DataSource for BleSource {
    fn name(&self) -> &'static str {
        "BLE"
    }

    async fn start(&mut self) -> Result<(), ConnectionError> {
        self.stop().await;
        match self.establish().await {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn next_record(&mut self) -> Ingest {
        match self.session.as_mut() {
            Some(session) => session.next().await,
            None => Ingest::Fatal(ConnectionError::ConnectionLost(
                "source not started".to_string(),
            )),
        }
    }

    async fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            self.state = session.state();
        }
    }

    async fn is_connected(&self) -> bool {
        match &self.session {
            Some(session) => session.is_connected().await,
            None => false,
        }
    }
}

/// Synthetic IMU stream.
///
/// Values are smooth functions of sample time, so two sources with the same
/// rate produce identical records. Every 10th sample has no audio reading.
pub struct MockSource {
    interval: Duration,
    tick: u64,
    next_due: Option<Instant>,
}

impl MockSource {
    pub fn new(rate_hz: f64) -> Self {
        let rate = if rate_hz.is_finite() && rate_hz > 0.0 { rate_hz } else { 25.0 };
        Self {
            interval: Duration::from_secs_f64(1.0 / rate),
            tick: 0,
            next_due: None,
        }
    }

    /// Wire line for sample `tick`
    pub fn line_for(&self, tick: u64) -> String {
        let t = tick as f64 * self.interval.as_secs_f64();
        let wave = |amplitude: f64, freq: f64| amplitude * (TAU * freq * t).sin();
        let audio = if tick % 10 == 9 {
            -1.0
        } else {
            (1000.0 * (TAU * 2.0 * t).sin()).abs()
        };

        format!(
            "{},{:.4},{:.4},{:.4},{:.3},{:.3},{:.3},{:.2},{:.3}",
            (t * 1000.0).round() as u64,
            wave(0.5, 0.5),
            0.3 * (TAU * 0.3 * t).cos(),
            1.0 + wave(0.2, 0.1),
            wave(10.0, 0.8),
            15.0 * (TAU * 0.6 * t).cos(),
            wave(5.0, 0.4),
            25.0 + wave(3.0, 0.01),
            audio
        )
    }
}

#[async_trait]
impl DataSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&mut self) -> Result<(), ConnectionError> {
        log::info!(
            "Mock source started at {:.1} Hz",
            1.0 / self.interval.as_secs_f64()
        );
        self.tick = 0;
        self.next_due = Some(Instant::now());
        Ok(())
    }

    async fn next_record(&mut self) -> Ingest {
        let Some(due) = self.next_due else {
            return Ingest::Fatal(ConnectionError::ConnectionLost(
                "source not started".to_string(),
            ));
        };
        tokio::time::sleep_until(due).await;
        self.next_due = Some(due + self.interval);

        let line = self.line_for(self.tick);
        self.tick += 1;
        match parse_record(&line) {
            Ok(record) => Ingest::Record(record),
            Err(e) => {
                log::warn!("CSV parsing failed: {}", e);
                Ingest::Skip
            }
        }
    }

    async fn stop(&mut self) {
        if self.next_due.take().is_some() {
            log::info!("Mock source stopped after {} samples", self.tick);
        }
    }

    async fn is_connected(&self) -> bool {
        self.next_due.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_lines_are_deterministic() {
        let a = MockSource::new(25.0);
        let b = MockSource::new(25.0);
        for tick in 0..50 {
            assert_eq!(a.line_for(tick), b.line_for(tick));
        }
        assert!(a.line_for(0).starts_with("0,"));
        assert!(a.line_for(25).starts_with("1000,"));
    }

    #[test]
    fn test_mock_audio_missing_every_tenth_sample() {
        let source = MockSource::new(25.0);
        for tick in 0..40 {
            let record = parse_record(&source.line_for(tick)).unwrap();
            assert_eq!(record.audio_sampled().is_none(), tick % 10 == 9, "tick {}", tick);
        }
    }

    #[test]
    fn test_invalid_rate_falls_back() {
        let source = MockSource::new(0.0);
        assert_eq!(source.interval, Duration::from_secs_f64(1.0 / 25.0));
    }

    #[tokio::test]
    async fn test_mock_source_lifecycle() {
        let mut source = MockSource::new(200.0);
        assert!(!source.is_connected().await);
        assert!(matches!(source.next_record().await, Ingest::Fatal(_)));

        source.start().await.unwrap();
        assert!(source.is_connected().await);
        let mut millis = Vec::new();
        for _ in 0..3 {
            match source.next_record().await {
                Ingest::Record(r) => millis.push(r.timestamp_millis()),
                other => panic!("expected record, got {:?}", other),
            }
        }
        assert_eq!(millis, vec![0, 5, 10]);

        source.stop().await;
        assert!(!source.is_connected().await);
    }

    #[tokio::test]
    async fn test_unstarted_ble_source_is_inert() {
        let mut source = BleSource::new(DeviceConfig::default());
        assert_eq!(source.state(), SessionState::Idle);
        assert!(!source.is_connected().await);
        assert!(matches!(source.next_record().await, Ingest::Fatal(_)));
        source.stop().await;
    }

    #[test]
    fn test_from_config_selects_kind() {
        let mut config = Config::default();
        assert_eq!(from_config(&config).name(), "BLE");
        config.source.kind = SourceKind::Mock;
        assert_eq!(from_config(&config).name(), "mock");
    }
}

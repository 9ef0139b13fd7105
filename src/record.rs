//! # Sensor Record Module
//!
//! One immutable IMU/audio sample as sent by the device:
//! `millis,ax,ay,az,gx,gy,gz,tempC,audioRMS`.
//!
//! Records are only built by the parser (see `parser.rs`), so every value in
//! circulation came from a validated 9-field line.

use std::fmt;

/// Header row shared by the wire format and recorded CSV files
pub const CSV_HEADER: &str = "millis,ax,ay,az,gx,gy,gz,tempC,audioRMS";

/// `audioRMS` value the firmware sends when no audio window was sampled
pub const AUDIO_NOT_SAMPLED: f64 = -1.0;

/// Three-axis reading (accelerometer m/s², gyroscope deg/s)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axes {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Axes {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    timestamp_millis: u64,
    accel: Axes,
    gyro: Axes,
    temperature_c: f64,
    audio_rms: f64,
}

impl Record {
    pub(crate) fn from_fields(
        timestamp_millis: u64,
        accel: Axes,
        gyro: Axes,
        temperature_c: f64,
        audio_rms: f64,
    ) -> Self {
        Self {
            timestamp_millis,
            accel,
            gyro,
            temperature_c,
            audio_rms,
        }
    }

    /// Milliseconds since device boot
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp_millis
    }

    pub fn accel(&self) -> Axes {
        self.accel
    }

    pub fn gyro(&self) -> Axes {
        self.gyro
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    /// Raw audio RMS, `AUDIO_NOT_SAMPLED` when missing
    pub fn audio_rms(&self) -> f64 {
        self.audio_rms
    }

    /// Audio RMS if the device sampled audio on this tick
    pub fn audio_sampled(&self) -> Option<f64> {
        if self.audio_rms < 0.0 {
            None
        } else {
            Some(self.audio_rms)
        }
    }

    /// Fixed-precision row used for recorded files (no trailing newline).
    ///
    /// Motion fields keep 6 decimals, temperature 2, audio 3.
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.2},{:.3}",
            self.timestamp_millis,
            self.accel.x,
            self.accel.y,
            self.accel.z,
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
            self.temperature_c,
            self.audio_rms
        )
    }
}

/// Wire form with full float precision, so parsing it back yields the same record
impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{}",
            self.timestamp_millis,
            self.accel.x,
            self.accel.y,
            self.accel.z,
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
            self.temperature_c,
            self.audio_rms
        )
    }
}

//! Receive, buffer and record IMU telemetry streamed over BLE by a
//! XIAO nRF52840 Sense board.
//!
//! Data path:
//! notification bytes → `framing` → `parser` → `buffer` → `recorder`.
//! `session`, `ble` and `supervisor` keep the notifications coming;
//! `connection` runs all of it on its own thread.

pub mod ble;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod device_scanner;
pub mod error;
pub mod framing;
pub mod parser;
pub mod record;
pub mod recorder;
pub mod session;
pub mod source;
pub mod supervisor;

pub use buffer::RingBuffer;
pub use config::Config;
pub use record::Record;
pub use recorder::RecorderManager;

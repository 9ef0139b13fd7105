//! # Error Types Module
//!
//! Centralized error handling for sense-stream.
//! Each layer gets its own error type so callers can tell recoverable
//! conditions (a malformed line) from terminal ones (retries exhausted).
//!
//! ## Error Types
//! - `ConnectionError`: scanning, connecting and mid-stream transport failures
//! - `ScanError`: Bluetooth manager/adapter failures while scanning
//! - `MalformedRecord`: a reassembled line that is not a valid record
//! - `RecordingError`: recorder misuse and filesystem failures
//! - `ConfigError`: configuration file I/O and parsing errors
//!
//! ## Propagation
//! - Framing and parse errors are logged inside the ingestion loop and never escape it
//! - Connection errors go to the supervisor, which retries and finally reports
//!   `ConnectionError::RetriesExhausted`
//! - Recording errors go straight back to the `RecorderManager` caller
//! - Buffer data loss is advisory and travels as `SinceRead::data_lost`

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while establishing or running a device connection
#[derive(Debug)]
pub enum ConnectionError {
    /// Failed to create Tokio runtime
    RuntimeCreation(String),
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Scanning itself failed
    Scan(ScanError),
    /// Scan finished without a device matching the criteria
    DeviceNotFound { name: String, service_id: String },
    /// Failed to connect to, or configure, a specific device
    ConnectionFailed { device_id: String, reason: String },
    /// The connect call did not complete in time
    ConnectTimeout { device_id: String, after: Duration },
    /// The link dropped while streaming
    ConnectionLost(String),
    /// The supervisor gave up
    RetriesExhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::RuntimeCreation(msg) => {
                write!(f, "Failed to create async runtime: {}", msg)
            }
            ConnectionError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            ConnectionError::Scan(e) => write!(f, "Device scan failed: {}", e),
            ConnectionError::DeviceNotFound { name, service_id } => {
                write!(
                    f,
                    "No device named '{}' or advertising service {} was found",
                    name, service_id
                )
            }
            ConnectionError::ConnectionFailed { device_id, reason } => {
                write!(f, "Failed to connect to device {}: {}", device_id, reason)
            }
            ConnectionError::ConnectTimeout { device_id, after } => {
                write!(
                    f,
                    "Connection to device {} timed out after {:.1}s",
                    device_id,
                    after.as_secs_f64()
                )
            }
            ConnectionError::ConnectionLost(reason) => {
                write!(f, "BLE connection lost: {}", reason)
            }
            ConnectionError::RetriesExhausted { attempts, last } => {
                write!(
                    f,
                    "Giving up after {} connection attempts (last error: {})",
                    attempts, last
                )
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Scan(e) => Some(e),
            ConnectionError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl From<ScanError> for ConnectionError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::NoAdapters => ConnectionError::NoAdapter,
            other => ConnectionError::Scan(other),
        }
    }
}

/// Errors that can occur during device scanning
#[derive(Debug, Clone)]
pub enum ScanError {
    /// Bluetooth manager initialization failed
    ManagerInit(String),
    /// No Bluetooth adapters available
    NoAdapters,
    /// Scan operation failed
    ScanFailed(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::ManagerInit(msg) => {
                write!(f, "Failed to initialize Bluetooth manager: {}", msg)
            }
            ScanError::NoAdapters => {
                write!(f, "No Bluetooth adapters found")
            }
            ScanError::ScanFailed(msg) => {
                write!(f, "Scan operation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// Why a line was rejected by the record parser
#[derive(Debug, Clone, PartialEq)]
pub enum MalformedReason {
    /// Comma-split field count was not 9
    FieldCount(usize),
    /// A field could not be converted to its numeric type
    InvalidField {
        index: usize,
        name: &'static str,
        value: String,
    },
}

/// A reassembled line that could not be turned into a `Record`.
///
/// Recoverable: the ingestion loop logs it and moves on.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRecord {
    pub line: String,
    pub reason: MalformedReason,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            MalformedReason::FieldCount(count) => {
                write!(f, "Unexpected CSV field count {} in '{}'", count, self.line)
            }
            MalformedReason::InvalidField { index, name, value } => {
                write!(
                    f,
                    "Field {} ({}) is not numeric: '{}' in '{}'",
                    index, name, value, self.line
                )
            }
        }
    }
}

impl std::error::Error for MalformedRecord {}

/// Errors that can occur while starting or stopping a recording
#[derive(Debug)]
pub enum RecordingError {
    /// `start` called while a session is active
    AlreadyRecording,
    /// `stop` called with no active session
    NotRecording,
    /// Filesystem failure on the recording or its directory
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to serialize session metadata
    Metadata(serde_json::Error),
    /// Worker thread did not exit within the stop timeout
    WorkerTimeout(Duration),
    /// Worker thread failed while writing rows
    Worker(String),
}

impl RecordingError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RecordingError::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for RecordingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingError::AlreadyRecording => write!(f, "Recording already in progress"),
            RecordingError::NotRecording => write!(f, "No recording in progress"),
            RecordingError::Io { path, source } => {
                write!(f, "Recording I/O failure on {}: {}", path.display(), source)
            }
            RecordingError::Metadata(e) => {
                write!(f, "Failed to serialize recording metadata: {}", e)
            }
            RecordingError::WorkerTimeout(after) => {
                write!(
                    f,
                    "Recording worker did not stop within {:.1}s",
                    after.as_secs_f64()
                )
            }
            RecordingError::Worker(msg) => write!(f, "Recording worker failed: {}", msg),
        }
    }
}

impl std::error::Error for RecordingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordingError::Io { source, .. } => Some(source),
            RecordingError::Metadata(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::NoAdapter;
        assert!(err.to_string().contains("Bluetooth"));
    }

    #[test]
    fn test_no_adapters_maps_to_no_adapter() {
        let err: ConnectionError = ScanError::NoAdapters.into();
        assert!(matches!(err, ConnectionError::NoAdapter));

        let err: ConnectionError = ScanError::ScanFailed("busy".into()).into();
        assert!(matches!(err, ConnectionError::Scan(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_retries_exhausted_chains_last_error() {
        let err = ConnectionError::RetriesExhausted {
            attempts: 5,
            last: Box::new(ConnectionError::ConnectionLost("sentinel".into())),
        };
        assert!(err.to_string().contains("5 connection attempts"));
        assert!(err.source().unwrap().to_string().contains("sentinel"));
    }

    #[test]
    fn test_malformed_record_display() {
        let err = MalformedRecord {
            line: "1,2,3".into(),
            reason: MalformedReason::FieldCount(3),
        };
        assert!(err.to_string().contains("field count 3"));
    }

    #[test]
    fn test_recording_error_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = RecordingError::io("/tmp/x.csv", io_err);
        assert!(err.source().is_some());
        assert!(err.to_string().contains("/tmp/x.csv"));
    }

    #[test]
    fn test_config_error_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());
    }
}

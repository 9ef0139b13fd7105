//! # Device Discovery Module
//!
//! Scans for BLE peripherals and picks the sensor to connect to.
//!
//! ## Selection policy
//! Candidates are checked in scan order. A candidate matches on an exact
//! advertised name or, failing that, on an advertised service id compared
//! case-insensitively. The first match wins; several matching devices are not
//! disambiguated. When an address is configured, only that address matches.

use crate::error::{ConnectionError, ScanError};
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;

/// Nordic UART Service
pub const NUS_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
/// NUS TX characteristic (notify, device to host)
pub const NUS_TX_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
/// NUS RX characteristic (write, host to device). Unused.
pub const NUS_RX_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

pub const DEFAULT_DEVICE_NAME: &str = "XIAO Sense IMU";

/// Advertisement data for one discovered peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<String>,
}

impl BluetoothDevice {
    pub fn new(address: String, name: Option<String>, services: Vec<String>) -> Self {
        Self {
            address,
            name,
            services,
        }
    }
}

/// A scan result paired with the btleplug handle used to connect to it
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub info: BluetoothDevice,
    pub peripheral: Peripheral,
}

/// What to look for during `resolve`
#[derive(Debug, Clone)]
pub struct MatchCriteria {
    pub name: String,
    pub service_id: String,
    pub address: Option<String>,
}

impl Default for MatchCriteria {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            service_id: NUS_SERVICE_UUID.to_string(),
            address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Address,
    Name,
    ServiceId,
}

/// The device chosen by `resolve`, with the adapter it was seen on
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub adapter: Adapter,
    pub peripheral: Peripheral,
    pub info: BluetoothDevice,
    pub reason: MatchReason,
}

fn match_reason(device: &BluetoothDevice, criteria: &MatchCriteria) -> Option<MatchReason> {
    if let Some(address) = &criteria.address {
        return device
            .address
            .eq_ignore_ascii_case(address)
            .then_some(MatchReason::Address);
    }

    if device.name.as_deref() == Some(criteria.name.as_str()) {
        return Some(MatchReason::Name);
    }

    if device
        .services
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&criteria.service_id))
    {
        return Some(MatchReason::ServiceId);
    }

    None
}

/// Index of the first candidate matching `criteria`, in scan order
pub fn select_device(
    candidates: &[BluetoothDevice],
    criteria: &MatchCriteria,
) -> Option<(usize, MatchReason)> {
    candidates.iter().enumerate().find_map(|(i, device)| {
        log::debug!(
            "Device discovered: addr={} name={:?} uuids={:?}",
            device.address,
            device.name,
            device.services
        );
        match_reason(device, criteria).map(|reason| (i, reason))
    })
}

async fn first_adapter() -> Result<Adapter, ScanError> {
    let manager = Manager::new()
        .await
        .map_err(|e| ScanError::ManagerInit(e.to_string()))?;

    let adapters = manager
        .adapters()
        .await
        .map_err(|e| ScanError::ManagerInit(e.to_string()))?;

    adapters.into_iter().next().ok_or(ScanError::NoAdapters)
}

async fn scan_adapter(
    central: &Adapter,
    timeout: Duration,
) -> Result<Vec<DiscoveredDevice>, ScanError> {
    central
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to start scan: {}", e)))?;

    tokio::time::sleep(timeout).await;

    central
        .stop_scan()
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to stop scan: {}", e)))?;

    let peripherals = central
        .peripherals()
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to get peripherals: {}", e)))?;

    let mut devices = Vec::new();
    for peripheral in peripherals {
        let (name, services) = match peripheral.properties().await {
            Ok(Some(props)) => (
                props.local_name,
                props.services.iter().map(|u| u.to_string()).collect(),
            ),
            Ok(None) => (None, Vec::new()),
            Err(e) => {
                log::debug!("Skipping peripheral without properties: {}", e);
                continue;
            }
        };
        let info = BluetoothDevice::new(peripheral.address().to_string(), name, services);
        devices.push(DiscoveredDevice { info, peripheral });
    }

    log::debug!("Scan completed: {} devices found", devices.len());
    Ok(devices)
}

/// Scan for nearby BLE devices for `timeout`
pub async fn scan_devices(timeout: Duration) -> Result<Vec<DiscoveredDevice>, ScanError> {
    let central = first_adapter().await?;
    scan_adapter(&central, timeout).await
}

/// Scan and return the first device matching `criteria`
pub async fn resolve(
    criteria: &MatchCriteria,
    timeout: Duration,
) -> Result<ResolvedDevice, ConnectionError> {
    log::info!(
        "BLE device discovery started: name='{}' service='{}' timeout={:.1}s",
        criteria.name,
        criteria.service_id,
        timeout.as_secs_f64()
    );

    let adapter = first_adapter().await?;
    let mut devices = scan_adapter(&adapter, timeout).await?;

    let infos: Vec<BluetoothDevice> = devices.iter().map(|d| d.info.clone()).collect();
    let Some((index, reason)) = select_device(&infos, criteria) else {
        return Err(ConnectionError::DeviceNotFound {
            name: criteria.name.clone(),
            service_id: criteria.service_id.clone(),
        });
    };

    let chosen = devices.swap_remove(index);
    log::info!(
        "Device selected by {:?} match: {:?} ({})",
        reason,
        chosen.info.name,
        chosen.info.address
    );

    Ok(ResolvedDevice {
        adapter,
        peripheral: chosen.peripheral,
        info: chosen.info,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, name: Option<&str>, services: &[&str]) -> BluetoothDevice {
        BluetoothDevice::new(
            address.to_string(),
            name.map(str::to_string),
            services.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_name_match() {
        let candidates = vec![
            device("AA", Some("Other"), &[]),
            device("BB", Some(DEFAULT_DEVICE_NAME), &[]),
        ];
        let selected = select_device(&candidates, &MatchCriteria::default());
        assert_eq!(selected, Some((1, MatchReason::Name)));
    }

    #[test]
    fn test_service_match_is_case_insensitive() {
        let candidates = vec![device(
            "AA",
            None,
            &["6E400001-B5A3-F393-E0A9-E50E24DCCA9E"],
        )];
        let selected = select_device(&candidates, &MatchCriteria::default());
        assert_eq!(selected, Some((0, MatchReason::ServiceId)));
    }

    #[test]
    fn test_first_candidate_in_scan_order_wins() {
        // A service match earlier in the scan beats a name match later on
        let candidates = vec![
            device("AA", None, &[NUS_SERVICE_UUID]),
            device("BB", Some(DEFAULT_DEVICE_NAME), &[]),
        ];
        let selected = select_device(&candidates, &MatchCriteria::default());
        assert_eq!(selected, Some((0, MatchReason::ServiceId)));
    }

    #[test]
    fn test_name_reported_over_service_on_same_device() {
        let candidates = vec![device("AA", Some(DEFAULT_DEVICE_NAME), &[NUS_SERVICE_UUID])];
        let selected = select_device(&candidates, &MatchCriteria::default());
        assert_eq!(selected, Some((0, MatchReason::Name)));
    }

    #[test]
    fn test_name_must_match_exactly() {
        let candidates = vec![device("AA", Some("xiao sense imu"), &[])];
        assert_eq!(select_device(&candidates, &MatchCriteria::default()), None);
    }

    #[test]
    fn test_address_override() {
        let criteria = MatchCriteria {
            address: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ..MatchCriteria::default()
        };
        let candidates = vec![
            device("11:22:33:44:55:66", Some(DEFAULT_DEVICE_NAME), &[]),
            device("AA:BB:CC:DD:EE:FF", None, &[]),
        ];
        assert_eq!(
            select_device(&candidates, &criteria),
            Some((1, MatchReason::Address))
        );
    }

    #[test]
    fn test_no_match() {
        let candidates = vec![device("AA", Some("Polar H10"), &["180d"])];
        assert_eq!(select_device(&candidates, &MatchCriteria::default()), None);
    }
}

//! # BLE Transport Module
//!
//! `NotifyLink` implementation over btleplug.
//!
//! Two background tasks run per subscription:
//! - a pump that forwards characteristic notifications into the
//!   synchronous `NotificationHandler`
//! - a watcher on the adapter event stream that fires the disconnect signal
//!   when this peripheral goes away
//!
//! Both are aborted on unsubscribe, disconnect and drop.

use crate::device_scanner::ResolvedDevice;
use crate::error::ConnectionError;
use crate::session::{DisconnectSignal, NotificationHandler, NotifyLink};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct BleLink {
    adapter: Adapter,
    peripheral: Peripheral,
    device_id: String,
    notify_char: Characteristic,
    tasks: Vec<JoinHandle<()>>,
}

impl BleLink {
    /// Connect to `device` and locate the notify characteristic `notify_uuid`
    pub async fn connect(
        device: ResolvedDevice,
        notify_uuid: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let device_id = device.info.address.clone();
        log::info!(
            "BLE connection starting: {} ({:?})",
            device_id,
            device.info.name
        );

        match tokio::time::timeout(timeout, device.peripheral.connect()).await {
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout {
                    device_id,
                    after: timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(ConnectionError::ConnectionFailed {
                    device_id,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(())) => {}
        }

        let found = Self::find_notify_char(&device.peripheral, &device_id, notify_uuid).await;
        match found {
            Ok(notify_char) => {
                log::info!("BLE connection established: {}", device_id);
                Ok(Self {
                    adapter: device.adapter,
                    peripheral: device.peripheral,
                    device_id,
                    notify_char,
                    tasks: Vec::new(),
                })
            }
            Err(e) => {
                if let Err(cleanup) = device.peripheral.disconnect().await {
                    log::debug!("Disconnect after failed setup: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn find_notify_char(
        peripheral: &Peripheral,
        device_id: &str,
        notify_uuid: &str,
    ) -> Result<Characteristic, ConnectionError> {
        let failed = |reason: String| ConnectionError::ConnectionFailed {
            device_id: device_id.to_string(),
            reason,
        };

        if !peripheral.is_connected().await.unwrap_or(false) {
            return Err(failed("peripheral reports not connected after connect".into()));
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| failed(format!("service discovery failed: {}", e)))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid.to_string().eq_ignore_ascii_case(notify_uuid))
            .ok_or_else(|| failed(format!("characteristic {} not found", notify_uuid)))?;

        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(failed(format!(
                "characteristic {} does not support notify",
                notify_uuid
            )));
        }

        Ok(characteristic)
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn link_error(&self, e: btleplug::Error) -> ConnectionError {
        ConnectionError::ConnectionFailed {
            device_id: self.device_id.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl NotifyLink for BleLink {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    async fn subscribe(
        &mut self,
        mut handler: NotificationHandler,
        on_disconnect: DisconnectSignal,
    ) -> Result<(), ConnectionError> {
        let mut events = self.adapter.events().await.map_err(|e| self.link_error(e))?;
        let id = self.peripheral.id();
        let watcher_signal = on_disconnect.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        watcher_signal.notify();
                        break;
                    }
                }
            }
        }));

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| self.link_error(e))?;
        self.peripheral
            .subscribe(&self.notify_char)
            .await
            .map_err(|e| self.link_error(e))?;

        let uuid = self.notify_char.uuid;
        self.tasks.push(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    handler.on_notification(&notification.value);
                }
            }
            // Stream end means the peripheral is gone
            on_disconnect.notify();
        }));

        log::info!("Notifications enabled on {}", self.notify_char.uuid);
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), ConnectionError> {
        self.abort_tasks();
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        self.peripheral
            .unsubscribe(&self.notify_char)
            .await
            .map_err(|e| self.link_error(e))
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        self.abort_tasks();
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        log::info!("Disconnecting from {}", self.device_id);
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| self.link_error(e))
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

//! # Connection Management Module
//!
//! Owns the ingestion thread: a dedicated OS thread running a current-thread
//! Tokio runtime, on which one `ConnectionSupervisor` at a time streams
//! records into the shared ring buffer.
//!
//! ## Key Components
//! - `ConnectionManager`: command loop, consumed by `run`
//! - `ConnectionCommand`: sent from the application thread
//! - `ConnectionStatus`: lifecycle updates sent back to the application
//!
//! Each connection gets its own stop flag. `Disconnect` sets it and waits for
//! the supervisor task to wind down, so a following `Connect` never overlaps.

use crate::buffer::RingBuffer;
use crate::config::Config;
use crate::error::ConnectionError;
use crate::source;
use crate::supervisor::ConnectionSupervisor;
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Terminal: the supervisor gave up or the runtime could not start
    Error(String),
}

struct ActiveConnection {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ActiveConnection {
    async fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.task.await {
            log::error!("Connection task ended abnormally: {}", e);
        }
    }
}

pub struct ConnectionManager {
    command_receiver: UnboundedReceiver<ConnectionCommand>,
    status_sender: Sender<ConnectionStatus>,
    buffer: Arc<RingBuffer>,
    config: Config,
}

impl ConnectionManager {
    /// Creates a new ConnectionManager.
    ///
    /// Returns the manager and a sender for issuing commands from any thread.
    pub fn new(
        buffer: Arc<RingBuffer>,
        config: Config,
        status_sender: Sender<ConnectionStatus>,
    ) -> (Self, UnboundedSender<ConnectionCommand>) {
        let (command_sender, command_receiver) = unbounded_channel();

        let manager = ConnectionManager {
            command_receiver,
            status_sender,
            buffer,
            config,
        };

        (manager, command_sender)
    }

    /// Runs the connection management loop.
    ///
    /// Call this on a dedicated thread. Blocks until the command channel is
    /// closed, then stops any active connection.
    pub fn run(self) {
        let rt = match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let error = ConnectionError::RuntimeCreation(e.to_string());
                log::error!("{}", error);
                let _ = self
                    .status_sender
                    .send(ConnectionStatus::Error(error.to_string()));
                return;
            }
        };

        rt.block_on(self.command_loop());
    }

    async fn command_loop(mut self) {
        let mut active: Option<ActiveConnection> = None;

        while let Some(command) = self.command_receiver.recv().await {
            match command {
                ConnectionCommand::Connect => {
                    if active.as_ref().is_some_and(|a| !a.task.is_finished()) {
                        log::warn!("Connection manager: already connected, ignoring Connect");
                        continue;
                    }
                    log::info!(
                        "Connection manager: starting {:?} source",
                        self.config.source.kind
                    );
                    active = Some(self.spawn_connection());
                }
                ConnectionCommand::Disconnect => {
                    log::info!("Connection manager: Disconnect requested");
                    if let Some(connection) = active.take() {
                        connection.shutdown().await;
                    }
                }
            }
        }

        log::info!("Connection manager: Command channel closed, shutting down");
        if let Some(connection) = active.take() {
            connection.shutdown().await;
        }
    }

    fn spawn_connection(&self) -> ActiveConnection {
        let stop = Arc::new(AtomicBool::new(false));
        let supervisor = ConnectionSupervisor::new(
            self.config.retry.policy(),
            self.buffer.clone(),
            stop.clone(),
        );
        let mut data_source = source::from_config(&self.config);
        let status_sender = self.status_sender.clone();

        let task = tokio::spawn(async move {
            let result = supervisor
                .run(data_source.as_mut(), |status| {
                    log::debug!("Connection status: {:?}", status);
                    let _ = status_sender.send(status);
                })
                .await;
            if let Err(e) = result {
                log::error!("{}", e);
            }
        });

        ActiveConnection { stop, task }
    }
}

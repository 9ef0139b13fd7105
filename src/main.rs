use crossbeam_channel::{never, select, tick, Receiver};
use sense_stream::config::{Config, SourceKind};
use sense_stream::connection::{ConnectionCommand, ConnectionManager, ConnectionStatus};
use sense_stream::recorder::{DeviceInfo, RecorderManager};
use sense_stream::RingBuffer;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Fires once on Ctrl+C
fn shutdown_signal() -> Receiver<()> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Cannot listen for Ctrl+C: {}", e);
                    return;
                }
            };
            if let Err(e) = rt.block_on(tokio::signal::ctrl_c()) {
                log::error!("Cannot listen for Ctrl+C: {}", e);
                return;
            }
            let _ = sender.send(());
        });
    if let Err(e) = spawned {
        log::error!("Cannot spawn signal thread: {}", e);
    }
    receiver
}

fn device_info(config: &Config) -> DeviceInfo {
    match config.source.kind {
        SourceKind::Ble => DeviceInfo {
            source: "ble".to_string(),
            name: Some(config.device.name.clone()),
            service_uuid: Some(config.device.service_uuid.clone()),
        },
        SourceKind::Mock => DeviceInfo {
            source: "mock".to_string(),
            ..DeviceInfo::default()
        },
    }
}

enum Event {
    Status(Option<ConnectionStatus>),
    Shutdown,
    /// The signal thread is gone; Ctrl+C falls back to the default handler
    NoSignals,
    Stats,
}

fn log_stats(buffer: &RingBuffer, recorder: &RecorderManager) {
    let stats = buffer.stats();
    log::info!(
        "Buffer {}/{} samples, {:.1} Hz",
        stats.fill_level,
        buffer.capacity(),
        stats.sample_rate_hz
    );
    if let Some(status) = recorder.status() {
        log::info!(
            "Recording {}: {} samples, {} gaps, {:.0}s",
            status.session_id,
            status.samples_written,
            status.data_gaps,
            status.elapsed.as_secs_f64()
        );
    }
}

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("{}; using defaults", e);
            Config::default()
        }
    };

    let buffer = Arc::new(RingBuffer::new(config.buffer.capacity));
    let mut recorder = match RecorderManager::new(buffer.clone(), config.recording.settings()) {
        Ok(recorder) => recorder.with_device_info(device_info(&config)),
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let (status_sender, status_receiver) = crossbeam_channel::unbounded();
    let (manager, commands) = ConnectionManager::new(buffer.clone(), config.clone(), status_sender);

    // Ingestion gets its own thread and runtime
    let ingestion = match std::thread::Builder::new()
        .name("ingestion".to_string())
        .spawn(move || manager.run())
    {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Cannot spawn ingestion thread: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut shutdown = shutdown_signal();
    let stats = tick(STATS_INTERVAL);
    let _ = commands.send(ConnectionCommand::Connect);

    if config.recording.record_on_start {
        match recorder.start(config.recording.prefix.as_deref()) {
            Ok(status) => log::info!("Recording to {}", status.file_path.display()),
            Err(e) => log::error!("Could not start recording: {}", e),
        }
    }

    let mut exit = ExitCode::SUCCESS;
    loop {
        let event = select! {
            recv(status_receiver) -> msg => Event::Status(msg.ok()),
            recv(shutdown) -> msg => if msg.is_ok() { Event::Shutdown } else { Event::NoSignals },
            recv(stats) -> _ => Event::Stats,
        };

        match event {
            Event::Status(Some(ConnectionStatus::Error(reason))) => {
                log::error!("Connection failed permanently: {}", reason);
                exit = ExitCode::FAILURE;
                break;
            }
            Event::Status(Some(status)) => log::info!("Connection status: {:?}", status),
            Event::Status(None) => {
                log::warn!("Ingestion thread exited");
                exit = ExitCode::FAILURE;
                break;
            }
            Event::Shutdown => {
                log::info!("Shutdown requested");
                break;
            }
            Event::NoSignals => shutdown = never(),
            Event::Stats => log_stats(&buffer, &recorder),
        }
    }

    if recorder.is_recording() {
        match recorder.stop() {
            Ok(session) => log::info!(
                "Saved {} samples to {}",
                session.total_samples,
                session.file_path.display()
            ),
            Err(e) => log::error!("Failed to finalize recording: {}", e),
        }
    }

    let _ = commands.send(ConnectionCommand::Disconnect);
    drop(commands);
    if ingestion.join().is_err() {
        log::error!("Ingestion thread panicked");
        exit = ExitCode::FAILURE;
    }

    exit
}

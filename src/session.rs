//! # Connection Session Module
//!
//! Owns one device connection from subscription to teardown.
//!
//! ## Flow
//! 1. `open` subscribes through a `NotifyLink`, handing it a
//!    `NotificationHandler` and a `DisconnectSignal`
//! 2. The transport calls the handler synchronously for every notification;
//!    the handler reassembles lines and pushes them onto an unbounded queue
//! 3. `next` pops the queue, parses lines and yields tagged `Ingest` values
//! 4. `close` unsubscribes and disconnects, exactly once
//!
//! ## Disconnects and idle timeout
//! The disconnect callback sets a flag and pushes a sentinel, so a consumer
//! blocked on the queue wakes up. With an idle timeout configured, a quiet
//! period only fails the session if the link also reports not-connected.

use crate::error::ConnectionError;
use crate::framing::FrameAssembler;
use crate::parser::parse_record;
use crate::record::Record;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Subscribed,
    Streaming,
    Disconnected,
    Failed,
}

/// One step of the ingestion loop
#[derive(Debug)]
pub enum Ingest {
    Record(Record),
    /// A line was received but could not be parsed
    Skip,
    /// The session cannot continue
    Fatal(ConnectionError),
}

#[derive(Debug)]
enum QueueItem {
    Line(String),
    Disconnected,
}

/// Synchronous notification callback state.
///
/// Owned by whatever task drives notifications; never blocks.
pub struct NotificationHandler {
    assembler: FrameAssembler,
    queue: UnboundedSender<QueueItem>,
    disconnected: Arc<AtomicBool>,
}

impl NotificationHandler {
    /// Feed one notification payload
    pub fn on_notification(&mut self, payload: &[u8]) {
        log::debug!("Notification received: {} bytes", payload.len());
        for line in self.assembler.feed(payload) {
            if self.queue.send(QueueItem::Line(line)).is_err() {
                return;
            }
        }
        // Data trickling in after a disconnect must not leave the consumer waiting
        if self.disconnected.load(Ordering::SeqCst) {
            let _ = self.queue.send(QueueItem::Disconnected);
        }
    }
}

/// Disconnect callback handed to the transport
#[derive(Clone)]
pub struct DisconnectSignal {
    queue: UnboundedSender<QueueItem>,
    flag: Arc<AtomicBool>,
}

impl DisconnectSignal {
    pub fn notify(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            log::warn!("BLE connection lost (callback)");
        }
        let _ = self.queue.send(QueueItem::Disconnected);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Transport primitives a session needs
#[async_trait]
pub trait NotifyLink: Send + Sync {
    /// Identifier used in log messages
    fn device_id(&self) -> String;

    /// Start delivering notifications to `handler` and disconnects to `on_disconnect`
    async fn subscribe(
        &mut self,
        handler: NotificationHandler,
        on_disconnect: DisconnectSignal,
    ) -> Result<(), ConnectionError>;

    async fn unsubscribe(&mut self) -> Result<(), ConnectionError>;

    async fn disconnect(&mut self) -> Result<(), ConnectionError>;

    async fn is_connected(&self) -> bool;
}

pub struct ConnectionSession<L: NotifyLink> {
    link: L,
    state: SessionState,
    queue: UnboundedReceiver<QueueItem>,
    disconnected: Arc<AtomicBool>,
    idle_timeout: Option<Duration>,
    closed: bool,
}

impl<L: NotifyLink> ConnectionSession<L> {
    /// Subscribe to notifications on an already connected link
    pub async fn open(mut link: L, idle_timeout: Option<Duration>) -> Result<Self, ConnectionError> {
        let (sender, queue) = unbounded_channel();
        let disconnected = Arc::new(AtomicBool::new(false));

        let handler = NotificationHandler {
            assembler: FrameAssembler::new(),
            queue: sender.clone(),
            disconnected: disconnected.clone(),
        };
        let signal = DisconnectSignal {
            queue: sender,
            flag: disconnected.clone(),
        };

        log::info!("Starting notification subscription: {}", link.device_id());
        if let Err(e) = link.subscribe(handler, signal).await {
            if let Err(cleanup) = link.disconnect().await {
                log::warn!("Disconnect after failed subscribe also failed: {}", cleanup);
            }
            return Err(e);
        }

        log::debug!("Session state: Connecting -> Subscribed");
        Ok(Self {
            link,
            state: SessionState::Subscribed,
            queue,
            disconnected,
            idle_timeout,
            closed: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub async fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst) && self.link.is_connected().await
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!("Session state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn lost(&mut self, reason: &str) -> Ingest {
        self.transition(SessionState::Disconnected);
        Ingest::Fatal(ConnectionError::ConnectionLost(reason.to_string()))
    }

    /// Wait for the next line and parse it
    pub async fn next(&mut self) -> Ingest {
        match self.state {
            SessionState::Subscribed => self.transition(SessionState::Streaming),
            SessionState::Streaming => {}
            _ => return self.lost("session is not streaming"),
        }

        loop {
            let item = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.queue.recv()).await {
                    Ok(item) => item,
                    Err(_) => {
                        log::warn!("Receive timeout ({:.1}s)", limit.as_secs_f64());
                        if self.disconnected.load(Ordering::SeqCst) || !self.link.is_connected().await {
                            return self.lost("no data within idle timeout and link is down");
                        }
                        continue;
                    }
                },
                None => self.queue.recv().await,
            };

            match item {
                Some(QueueItem::Line(line)) => {
                    return match parse_record(&line) {
                        Ok(record) => Ingest::Record(record),
                        Err(e) => {
                            log::warn!("CSV parsing failed: {}", e);
                            Ingest::Skip
                        }
                    };
                }
                Some(QueueItem::Disconnected) => return self.lost("device disconnected"),
                None => return self.lost("notification channel closed"),
            }
        }
    }

    /// Tear down the subscription and connection. Only the first call acts.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        log::info!("Stopping notification subscription: {}", self.link.device_id());
        if let Err(e) = self.link.unsubscribe().await {
            log::warn!("Unsubscribe failed: {}", e);
            self.transition(SessionState::Failed);
        }
        if let Err(e) = self.link.disconnect().await {
            log::warn!("Disconnect failed: {}", e);
        }
        if self.state != SessionState::Failed {
            self.transition(SessionState::Disconnected);
        }
    }

}

impl<L: NotifyLink> Drop for ConnectionSession<L> {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!(
                "Session for {} dropped without close; subscription left to the transport",
                self.link.device_id()
            );
        }
    }
}

/// Resolves once `flag` is set. Polled every 100 ms.
pub async fn wait_for_stop(flag: &AtomicBool) {
    loop {
        if flag.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        pub handler: Option<NotificationHandler>,
        pub signal: Option<DisconnectSignal>,
        pub connected: bool,
        pub fail_subscribe: bool,
        pub unsubscribes: usize,
        pub disconnects: usize,
    }

    #[derive(Clone, Default)]
    struct FakeLink {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeLink {
        pub fn connected() -> Self {
            let link = Self::default();
            link.state.lock().unwrap().connected = true;
            link
        }

        pub fn push(&self, bytes: &[u8]) {
            let mut state = self.state.lock().unwrap();
            state.handler.as_mut().expect("not subscribed").on_notification(bytes);
        }

        pub fn drop_link(&self) {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.signal.as_ref().expect("not subscribed").notify();
        }
    }

    #[async_trait]
    impl NotifyLink for FakeLink {
        fn device_id(&self) -> String {
            "fake".to_string()
        }

        async fn subscribe(
            &mut self,
            handler: NotificationHandler,
            on_disconnect: DisconnectSignal,
        ) -> Result<(), ConnectionError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_subscribe {
                return Err(ConnectionError::ConnectionFailed {
                    device_id: "fake".into(),
                    reason: "characteristic missing".into(),
                });
            }
            state.handler = Some(handler);
            state.signal = Some(on_disconnect);
            Ok(())
        }

        async fn unsubscribe(&mut self) -> Result<(), ConnectionError> {
            let mut state = self.state.lock().unwrap();
            state.unsubscribes += 1;
            state.handler = None;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), ConnectionError> {
            let mut state = self.state.lock().unwrap();
            state.disconnects += 1;
            state.connected = false;
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.state.lock().unwrap().connected
        }
    }

    const ROW: &str = "10,0.1,0.2,0.3,1,2,3,24.5,-1";

    #[tokio::test]
    async fn test_fragments_become_records() {
        let link = FakeLink::connected();
        let mut session = ConnectionSession::open(link.clone(), None).await.unwrap();
        assert_eq!(session.state(), SessionState::Subscribed);

        link.push(b"10,0.1,0.2,0.3,");
        link.push(b"1,2,3,24.5,-1\r");
        link.push(b"\nnot,a,record\n");

        match session.next().await {
            Ingest::Record(r) => assert_eq!(r.timestamp_millis(), 10),
            other => panic!("expected record, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Streaming);
        assert!(matches!(session.next().await, Ingest::Skip));
        session.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_sentinel_unblocks_consumer() {
        let link = FakeLink::connected();
        let mut session = ConnectionSession::open(link.clone(), None).await.unwrap();

        let dropper = link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            dropper.drop_link();
        });

        match session.next().await {
            Ingest::Fatal(ConnectionError::ConnectionLost(_)) => {}
            other => panic!("expected connection lost, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Disconnected);
        session.close().await;
    }

    #[tokio::test]
    async fn test_queued_lines_drain_before_sentinel() {
        let link = FakeLink::connected();
        let mut session = ConnectionSession::open(link.clone(), None).await.unwrap();
        link.push(format!("{}\n", ROW).as_bytes());
        link.drop_link();

        assert!(matches!(session.next().await, Ingest::Record(_)));
        assert!(matches!(session.next().await, Ingest::Fatal(_)));
        session.close().await;
    }

    #[tokio::test]
    async fn test_idle_timeout_waits_while_link_is_up() {
        let link = FakeLink::connected();
        let mut session = ConnectionSession::open(link.clone(), Some(Duration::from_millis(20)))
            .await
            .unwrap();

        let late = link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(90)).await;
            late.push(format!("{}\n", ROW).as_bytes());
        });

        assert!(matches!(session.next().await, Ingest::Record(_)));
        session.close().await;
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_when_link_is_down() {
        let link = FakeLink::connected();
        let mut session = ConnectionSession::open(link.clone(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        link.state.lock().unwrap().connected = false;

        match session.next().await {
            Ingest::Fatal(ConnectionError::ConnectionLost(reason)) => {
                assert!(reason.contains("idle timeout"))
            }
            other => panic!("expected connection lost, got {:?}", other),
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_tears_down_once() {
        let link = FakeLink::connected();
        let mut session = ConnectionSession::open(link.clone(), None).await.unwrap();
        session.close().await;
        session.close().await;

        let state = link.state.lock().unwrap();
        assert_eq!(state.unsubscribes, 1);
        assert_eq!(state.disconnects, 1);
    }

    #[tokio::test]
    async fn test_close_after_failure_still_tears_down() {
        let link = FakeLink::connected();
        let mut session = ConnectionSession::open(link.clone(), None).await.unwrap();
        link.push(format!("{}\n{}\n", ROW, ROW).as_bytes());
        link.drop_link();

        let mut received = 0;
        let error = loop {
            match session.next().await {
                Ingest::Record(_) => received += 1,
                Ingest::Skip => {}
                Ingest::Fatal(e) => break e,
            }
        };
        assert!(matches!(error, ConnectionError::ConnectionLost(_)));
        assert_eq!(received, 2);
        assert!(matches!(session.next().await, Ingest::Fatal(_)));

        session.close().await;
        session.close().await;
        let state = link.state.lock().unwrap();
        assert_eq!(state.unsubscribes, 1);
        assert_eq!(state.disconnects, 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_disconnects() {
        let link = FakeLink::connected();
        link.state.lock().unwrap().fail_subscribe = true;
        let result = ConnectionSession::open(link.clone(), None).await;
        assert!(result.is_err());
        assert_eq!(link.state.lock().unwrap().disconnects, 1);
    }
}

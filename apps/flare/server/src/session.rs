//! One chat session per accepted connection.
//!
//! `Connecting` → `Active` → `Closed`. The transport resolves identity before a
//! session exists, so a session always starts with a known sender. Becoming
//! active registers the connection and replays recent history; the receive
//! loop then stamps, persists and dispatches every frame until the client goes
//! away, a frame fails to decode, or the hub prunes the connection.

use std::sync::Arc;

use axum::extract::ws::Message;
use flare_core::{now_timestamp, InboundFrame};
use futures_util::{Stream, StreamExt};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::{
    error::{DecodeError, SessionError},
    hub::BroadcastHub,
    registry::ConnectionHandle,
    store::MessageStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    StreamEnded,
    ReadError,
    DecodeError,
    Pruned,
    HistoryFailed,
}

impl CloseReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::StreamEnded => "stream_ended",
            CloseReason::ReadError => "read_error",
            CloseReason::DecodeError => "decode_error",
            CloseReason::Pruned => "pruned",
            CloseReason::HistoryFailed => "history_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub history_replayed: usize,
    pub frames_relayed: usize,
    pub alerts_raised: usize,
    pub close_reason: CloseReason,
}

enum Decoded {
    Frame(InboundFrame),
    Control,
    Close(Option<String>),
}

fn decode(message: Message) -> Result<Decoded, DecodeError> {
    match message {
        Message::Text(text) => Ok(Decoded::Frame(serde_json::from_str(&text)?)),
        Message::Binary(bytes) => {
            let text = String::from_utf8(bytes)?;
            Ok(Decoded::Frame(serde_json::from_str(&text)?))
        }
        Message::Ping(_) | Message::Pong(_) => Ok(Decoded::Control),
        Message::Close(frame) => Ok(Decoded::Close(frame.map(|f| f.reason.to_string()))),
    }
}

pub struct ChatSession {
    handle: ConnectionHandle,
    hub: BroadcastHub,
    store: Arc<dyn MessageStore>,
    history_limit: usize,
    state: SessionState,
    history_replayed: usize,
    frames_relayed: usize,
    alerts_raised: usize,
}

impl ChatSession {
    pub fn new(
        handle: ConnectionHandle,
        hub: BroadcastHub,
        store: Arc<dyn MessageStore>,
        history_limit: usize,
    ) -> Self {
        Self {
            handle,
            hub,
            store,
            history_limit,
            state: SessionState::Connecting,
            history_replayed: 0,
            frames_relayed: 0,
            alerts_raised: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Registers the connection and replays recent history to it. On failure
    /// the session is already closed and deregistered.
    pub async fn activate(&mut self) -> Result<usize, SessionError> {
        if self.state != SessionState::Connecting {
            return Ok(self.history_replayed);
        }

        let registry = self.hub.registry();
        registry.add(self.handle.clone());
        gauge!("flare_connections_active", registry.len() as f64);
        counter!("flare_connections_total", 1);
        self.state = SessionState::Active;
        info!(
            connection_id = %self.handle.id(),
            identity = %self.handle.identity(),
            remote_addr = ?self.handle.remote_addr(),
            "chat session active"
        );

        match self.replay_history().await {
            Ok(count) => {
                self.history_replayed = count;
                Ok(count)
            }
            Err(err) => {
                warn!(
                    connection_id = %self.handle.id(),
                    error = %err,
                    "history replay failed; closing session"
                );
                self.close(CloseReason::HistoryFailed);
                Err(err)
            }
        }
    }

    async fn replay_history(&self) -> Result<usize, SessionError> {
        let history = self.store.recent_ordinary(self.history_limit).await?;
        let count = history.len();
        for record in history {
            self.handle
                .deliver_in_order(Arc::new(record))
                .await
                .map_err(SessionError::HistoryDelivery)?;
        }
        Ok(count)
    }

    /// Runs the whole lifecycle over `inbound` and returns once closed.
    pub async fn run<S>(mut self, mut inbound: S) -> SessionOutcome
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        if self.activate().await.is_err() {
            return self.outcome(CloseReason::HistoryFailed);
        }

        let closed = self.handle.close_token();
        let reason = loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break CloseReason::Pruned,
                next = inbound.next() => next,
            };

            let message = match next {
                None => break CloseReason::StreamEnded,
                Some(Err(err)) => {
                    warn!(
                        connection_id = %self.handle.id(),
                        error = %err,
                        "error receiving frame"
                    );
                    break CloseReason::ReadError;
                }
                Some(Ok(message)) => message,
            };

            match decode(message) {
                Ok(Decoded::Frame(frame)) => self.dispatch(frame).await,
                Ok(Decoded::Control) => continue,
                Ok(Decoded::Close(reason)) => {
                    debug!(
                        connection_id = %self.handle.id(),
                        reason = ?reason,
                        "client closed websocket"
                    );
                    break CloseReason::ClientClosed;
                }
                Err(err) => {
                    warn!(
                        connection_id = %self.handle.id(),
                        error = %err,
                        "dropping connection after undecodable frame"
                    );
                    break CloseReason::DecodeError;
                }
            }
        };

        self.close(reason);
        self.outcome(reason)
    }

    async fn dispatch(&mut self, frame: InboundFrame) {
        let message = frame.stamp(
            self.handle.identity(),
            self.handle.id().to_string(),
            self.handle.remote_addr(),
            now_timestamp(),
        );
        self.frames_relayed += 1;

        if message.is_priority {
            if let Err(err) = self.store.append_priority(&message).await {
                counter!("flare_persistence_failures_total", 1, "kind" => "priority");
                warn!(
                    connection_id = %self.handle.id(),
                    error = %err,
                    "failed to persist distress alert; relaying it anyway"
                );
            }
            let report = self.hub.broadcast_now(message);
            self.alerts_raised += 1;
            info!(
                connection_id = %self.handle.id(),
                identity = %self.handle.identity(),
                delivered = report.delivered,
                pruned = report.pruned,
                "distress alert relayed"
            );
            return;
        }

        if let Err(err) = self.store.append(&message).await {
            counter!("flare_persistence_failures_total", 1, "kind" => "ordinary");
            warn!(
                connection_id = %self.handle.id(),
                error = %err,
                "failed to persist message"
            );
        }
        if let Err(err) = self.hub.publish(message) {
            warn!(
                connection_id = %self.handle.id(),
                error = %err,
                "message not relayed"
            );
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.handle.close();

        let registry = self.hub.registry();
        registry.remove(self.handle.id());
        gauge!("flare_connections_active", registry.len() as f64);
        counter!(
            "flare_connections_closed_total",
            1,
            "reason" => reason.metric_label()
        );
        info!(
            connection_id = %self.handle.id(),
            identity = %self.handle.identity(),
            reason = reason.metric_label(),
            frames = self.frames_relayed,
            "chat session closed"
        );
    }

    fn outcome(&self, close_reason: CloseReason) -> SessionOutcome {
        SessionOutcome {
            history_replayed: self.history_replayed,
            frames_relayed: self.frames_relayed,
            alerts_raised: self.alerts_raised,
            close_reason,
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // a panicking or cancelled session task must not leave a stale entry
        self.close(CloseReason::StreamEnded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::PersistenceError,
        hub::HubWorker,
        registry::{ConnectionRegistry, Outbound},
        store::MemoryStore,
    };
    use async_trait::async_trait;
    use flare_core::{ChatMessage, Identity};
    use std::{pin::Pin, time::Duration};
    use tokio::{sync::mpsc, task::JoinHandle};
    use tokio_util::sync::CancellationToken;

    type Inbound = Pin<Box<dyn Stream<Item = Result<Message, axum::Error>> + Send>>;

    struct Relay {
        hub: BroadcastHub,
        worker: Option<HubWorker>,
        store: Arc<dyn MessageStore>,
        shutdown: CancellationToken,
    }

    struct Client {
        handle: ConnectionHandle,
        outbound: mpsc::Receiver<Outbound>,
        frames: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        task: JoinHandle<SessionOutcome>,
    }

    impl Relay {
        fn new(store: Arc<dyn MessageStore>) -> Self {
            let (hub, worker) = BroadcastHub::new(ConnectionRegistry::new());
            Self {
                hub,
                worker: Some(worker),
                store,
                shutdown: CancellationToken::new(),
            }
        }

        fn start_worker(&mut self) {
            if let Some(worker) = self.worker.take() {
                worker.spawn(self.shutdown.clone());
            }
        }

        fn registry(&self) -> &ConnectionRegistry {
            self.hub.registry()
        }

        async fn connect(&self, name: &str, history_limit: usize) -> Client {
            let client = self.connect_with_pending(name, history_limit, Vec::new());
            wait_until(|| self.registry().contains(client.handle.id())).await;
            client
        }

        fn connect_with_pending(
            &self,
            name: &str,
            history_limit: usize,
            pending: Vec<Message>,
        ) -> Client {
            self.spawn_session(name, history_limit, 256, pending)
        }

        fn spawn_session(
            &self,
            name: &str,
            history_limit: usize,
            capacity: usize,
            pending: Vec<Message>,
        ) -> Client {
            let (handle, outbound) = ConnectionHandle::open(
                Identity::new(name).unwrap(),
                Some("192.0.2.10:40000".parse().unwrap()),
                capacity,
                &self.shutdown,
            );
            let (frames, rx) = mpsc::unbounded_channel();
            for message in pending {
                frames.send(Ok(message)).unwrap();
            }
            let inbound: Inbound = Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }));
            let session = ChatSession::new(
                handle.clone(),
                self.hub.clone(),
                Arc::clone(&self.store),
                history_limit,
            );
            let task = tokio::spawn(session.run(inbound));
            Client {
                handle,
                outbound,
                frames,
                task,
            }
        }
    }

    impl Client {
        fn send(&self, frame: InboundFrame) {
            let text = serde_json::to_string(&frame).unwrap();
            self.frames.send(Ok(Message::Text(text))).unwrap();
        }

        async fn recv(&mut self) -> Outbound {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for message")
                .expect("outbound queue closed")
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    struct BrokenStore {
        history_fails: bool,
    }

    fn broken() -> PersistenceError {
        PersistenceError::Serde(serde_json::from_str::<()>("not json").unwrap_err())
    }

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn append(&self, _message: &ChatMessage) -> Result<(), PersistenceError> {
            Err(broken())
        }

        async fn append_priority(&self, _message: &ChatMessage) -> Result<(), PersistenceError> {
            Err(broken())
        }

        async fn recent_ordinary(
            &self,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>, PersistenceError> {
            if self.history_fails {
                Err(broken())
            } else {
                Ok(Vec::new())
            }
        }

        async fn recent_priority(
            &self,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn activation_and_drop_manage_registry_entry() {
        let relay = Relay::new(Arc::new(MemoryStore::new()));
        let (handle, _outbound) =
            ConnectionHandle::open(Identity::new("A").unwrap(), None, 4, &relay.shutdown);
        let mut session = ChatSession::new(
            handle.clone(),
            relay.hub.clone(),
            Arc::clone(&relay.store),
            10,
        );
        assert_eq!(session.state(), SessionState::Connecting);

        assert_eq!(session.activate().await.unwrap(), 0);
        assert_eq!(session.state(), SessionState::Active);
        assert!(relay.registry().contains(session.handle().id()));

        drop(session);
        assert!(!relay.registry().contains(handle.id()));
        assert!(handle.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn ordinary_message_reaches_every_participant() {
        let mut relay = Relay::new(Arc::new(MemoryStore::new()));
        relay.start_worker();
        let started = now_timestamp();

        let mut a = relay.connect("A", 100).await;
        let mut b = relay.connect("B", 100).await;

        a.send(InboundFrame::ordinary("hello"));

        for client in [&mut a, &mut b] {
            let message = client.recv().await;
            assert_eq!(message.sender, "A");
            assert_eq!(message.body, "hello");
            assert!(!message.is_priority);
            assert!(message.timestamp >= started);
            assert_eq!(message.origin_address, "192.0.2.10:40000");
        }

        let stored = relay.store.recent_ordinary(1).await.unwrap();
        assert_eq!(stored[0].body, "hello");
        assert_eq!(stored[0].origin_tag, a.handle.id().to_string());
    }

    #[test_timeout::tokio_timeout_test]
    async fn distress_alert_overtakes_queued_chat() {
        let mut relay = Relay::new(Arc::new(MemoryStore::new()));
        let mut a = relay.connect("A", 100).await;
        let mut b = relay.connect("B", 100).await;
        let c = relay.connect("C", 100).await;

        // hub worker is not draining yet, so C's message waits in the intake queue
        c.send(InboundFrame::ordinary("lunch?"));
        wait_until(|| relay.hub.pending() == 1).await;

        a.send(InboundFrame::distress("help"));
        for client in [&mut a, &mut b] {
            let first = client.recv().await;
            assert_eq!(first.body, "help");
            assert_eq!(first.sender, "A");
            assert!(first.is_priority);
        }

        relay.start_worker();
        assert_eq!(a.recv().await.body, "lunch?");
        assert_eq!(b.recv().await.body, "lunch?");

        let alerts = relay.store.recent_priority(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(relay.store.recent_ordinary(10).await.unwrap().iter().all(|m| !m.is_priority));
    }

    #[test_timeout::tokio_timeout_test]
    async fn newcomer_gets_bounded_history_before_live_traffic() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..150 {
            let record = InboundFrame::ordinary(i.to_string()).stamp(
                &Identity::new("old-timer").unwrap(),
                "conn-old",
                None,
                now_timestamp(),
            );
            store.append(&record).await.unwrap();
        }

        let mut relay = Relay::new(store);
        relay.start_worker();

        // D already has a frame waiting; it must not be handled before history
        let mut d = relay.connect_with_pending(
            "D",
            100,
            vec![Message::Text(r#"{"message":"hi all"}"#.into())],
        );

        let mut bodies = Vec::new();
        for _ in 0..100 {
            bodies.push(d.recv().await.body.clone());
        }
        let expected: Vec<String> = (50..150).rev().map(|i| i.to_string()).collect();
        assert_eq!(bodies, expected);

        let live = d.recv().await;
        assert_eq!(live.body, "hi all");
        assert_eq!(live.sender, "D");
    }

    #[test_timeout::tokio_timeout_test]
    async fn live_traffic_during_replay_keeps_small_buffer_connection() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            let record = InboundFrame::ordinary(format!("h{i}")).stamp(
                &Identity::new("old-timer").unwrap(),
                "conn-old",
                None,
                now_timestamp(),
            );
            store.append(&record).await.unwrap();
        }
        let settings = crate::state::RelaySettings {
            history_limit: 10,
            outbound_buffer: 4,
            ..Default::default()
        };

        let mut relay = Relay::new(store);
        relay.start_worker();
        let mut a = relay.connect("A", 0).await;

        // nobody drains D while its history and A's chatter pile up
        let mut d = relay.spawn_session(
            "D",
            settings.history_limit,
            settings.queue_capacity(),
            Vec::new(),
        );
        for i in 0..settings.outbound_buffer {
            a.send(InboundFrame::ordinary(format!("live{i}")));
        }
        for i in 0..settings.outbound_buffer {
            assert_eq!(a.recv().await.body, format!("live{i}"));
        }

        let mut history = Vec::new();
        let mut live = Vec::new();
        for _ in 0..settings.history_limit + settings.outbound_buffer {
            let message = d.recv().await;
            if message.body.starts_with('h') {
                history.push(message.body.clone());
            } else {
                live.push(message.body.clone());
            }
        }
        let expected: Vec<String> = (0..10).rev().map(|i| format!("h{i}")).collect();
        assert_eq!(history, expected);
        assert_eq!(live, vec!["live0", "live1", "live2", "live3"]);
        assert!(relay.registry().contains(d.handle.id()));
        assert!(!d.handle.is_closed());
        assert!(!d.task.is_finished());
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_connection_is_pruned_and_skipped() {
        let mut relay = Relay::new(Arc::new(MemoryStore::new()));
        relay.start_worker();

        let mut a = relay.connect("A", 0).await;
        let b = relay.connect("B", 0).await;
        let mut c = relay.connect("C", 0).await;

        let Client {
            handle: b_handle,
            outbound: b_outbound,
            frames: _b_frames,
            task: b_task,
        } = b;
        drop(b_outbound);

        a.send(InboundFrame::ordinary("one"));
        assert_eq!(a.recv().await.body, "one");
        assert_eq!(c.recv().await.body, "one");

        let outcome = b_task.await.unwrap();
        assert_eq!(outcome.close_reason, CloseReason::Pruned);
        assert!(!relay.registry().contains(b_handle.id()));

        c.send(InboundFrame::ordinary("two"));
        assert_eq!(a.recv().await.body, "two");
        assert_eq!(c.recv().await.body, "two");
        assert_eq!(relay.registry().len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn undecodable_frame_closes_and_deregisters() {
        let mut relay = Relay::new(Arc::new(MemoryStore::new()));
        relay.start_worker();

        let a = relay.connect("A", 0).await;
        a.frames.send(Ok(Message::Text("{not json".into()))).unwrap();

        let outcome = a.task.await.unwrap();
        assert_eq!(outcome.close_reason, CloseReason::DecodeError);
        assert!(relay.registry().is_empty());
        assert!(a.handle.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_frame_and_control_frames() {
        let mut relay = Relay::new(Arc::new(MemoryStore::new()));
        relay.start_worker();

        let a = relay.connect("A", 0).await;
        a.frames.send(Ok(Message::Ping(vec![1, 2]))).unwrap();
        a.send(InboundFrame::ordinary("still here"));
        a.frames.send(Ok(Message::Close(None))).unwrap();

        let outcome = a.task.await.unwrap();
        assert_eq!(outcome.close_reason, CloseReason::ClientClosed);
        assert_eq!(outcome.frames_relayed, 1);
        assert!(relay.registry().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn binary_json_frames_are_accepted() {
        let mut relay = Relay::new(Arc::new(MemoryStore::new()));
        relay.start_worker();

        let mut a = relay.connect("A", 0).await;
        a.frames
            .send(Ok(Message::Binary(br#"{"message":"bytes"}"#.to_vec())))
            .unwrap();
        assert_eq!(a.recv().await.body, "bytes");

        a.frames
            .send(Ok(Message::Binary(vec![0xff, 0xfe])))
            .unwrap();
        let outcome = a.task.await.unwrap();
        assert_eq!(outcome.close_reason, CloseReason::DecodeError);
    }

    #[test_timeout::tokio_timeout_test]
    async fn alerts_are_relayed_even_when_storage_is_down() {
        let mut relay = Relay::new(Arc::new(BrokenStore {
            history_fails: false,
        }));
        relay.start_worker();

        let mut a = relay.connect("A", 10).await;
        let mut b = relay.connect("B", 10).await;

        a.send(InboundFrame::distress("fire"));
        assert_eq!(b.recv().await.body, "fire");
        assert_eq!(a.recv().await.body, "fire");

        b.send(InboundFrame::ordinary("ok"));
        assert_eq!(a.recv().await.body, "ok");

        drop(a.frames);
        let outcome = a.task.await.unwrap();
        assert_eq!(outcome.alerts_raised, 1);
        assert_eq!(outcome.close_reason, CloseReason::StreamEnded);
    }

    #[test_timeout::tokio_timeout_test]
    async fn history_failure_aborts_session() {
        let relay = Relay::new(Arc::new(BrokenStore {
            history_fails: true,
        }));
        let a = relay.connect_with_pending("A", 10, Vec::new());

        let outcome = a.task.await.unwrap();
        assert_eq!(outcome.close_reason, CloseReason::HistoryFailed);
        assert!(relay.registry().is_empty());
        assert!(a.handle.is_closed());
    }
}

//! Reconnecting session client.
//!
//! ```text
//!  SessionClient (clone per consumer)
//!        │ Control (unbounded mpsc)
//!        ▼
//!  ┌──────────────┐   connect/send/close   ┌───────────┐
//!  │ SessionDriver│ ─────────────────────► │ Transport │
//!  │  state       │ ◄───────────────────── │           │
//!  │  policy      │     text frames        └───────────┘
//!  │  timers      │
//!  └──────┬───────┘
//!         │ publish
//!         ▼
//!  SnapshotBroadcast ──► listeners
//! ```
//!
//! The driver task is the only owner of the transport, the heartbeat and the
//! reconnect timer. Replacing or dropping the link drops whatever attempt or
//! timer belonged to the previous one, so a superseded connection can never
//! act on the session.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior, Sleep};

use crate::broadcast::{BroadcastStats, SnapshotBroadcast, Subscription};
use crate::config::{ClientConfig, ConfigError};
use crate::protocol::{timestamp_now, InboundEvent, JsonObject, MeetingPhase, OutboundMessage};
use crate::reconnect::{ReconnectPolicy, CLOSE_NORMAL};
use crate::state::{ConnectionState, SessionIdentity, SessionSnapshot, SessionState};
use crate::transport::{CloseInfo, Connector, Incoming, Transport, TransportError, WsConnector};

/// Client statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub connect_attempts: u64,
    pub connections_opened: u64,
    pub reconnects_scheduled: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub broadcast: BroadcastStats,
}

#[derive(Default)]
struct ClientCounters {
    connect_attempts: AtomicU64,
    connections_opened: AtomicU64,
    reconnects_scheduled: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ClientCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum Control {
    Init(SessionIdentity),
    Send(OutboundMessage),
    Stop,
    Shutdown,
}

/// Handle to one logical meeting session.
///
/// Cheap to clone; every clone talks to the same background task. The task
/// stops once [`shutdown`](Self::shutdown) is called or the last handle is
/// dropped.
#[derive(Clone)]
pub struct SessionClient {
    control: mpsc::UnboundedSender<Control>,
    broadcast: Arc<SnapshotBroadcast>,
    counters: Arc<ClientCounters>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionClient {
    /// Spawn the session task on the current Tokio runtime.
    ///
    /// Fails without spawning anything when `config` does not validate.
    pub fn new(
        config: ClientConfig,
        connector: impl Connector + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let broadcast = Arc::new(SnapshotBroadcast::new());
        let counters = Arc::new(ClientCounters::default());

        let driver = SessionDriver {
            policy: ReconnectPolicy::new(config.reconnect_base, config.reconnect_cap),
            state: SessionState::new(config.message_log_capacity),
            config,
            connector: Arc::new(connector),
            control: control_rx,
            broadcast: Arc::clone(&broadcast),
            counters: Arc::clone(&counters),
            identity: None,
            stopped: false,
            link: Link::Idle,
            generation: 0,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            control: control_tx,
            broadcast,
            counters,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    /// Client that connects over WebSocket to `config.base_url`.
    pub fn with_websocket(config: ClientConfig) -> Result<Self, ConfigError> {
        let connector = WsConnector::new(config.base_url.clone());
        Self::new(config, connector)
    }

    fn command(&self, control: Control) {
        if self.control.send(control).is_err() {
            log::debug!("Session task has exited; command ignored");
        }
    }

    /// Join `identity`'s meeting, switching away from any other meeting.
    ///
    /// Ignored when the meeting or user id is empty. Calling it again for the
    /// meeting already joined (or being joined) keeps the current connection.
    pub fn init(&self, identity: SessionIdentity) {
        self.command(Control::Init(identity));
    }

    /// Send an application-defined event. Dropped when not connected.
    pub fn send_message(&self, kind: impl Into<String>, payload: Value) {
        self.command(Control::Send(OutboundMessage::Custom {
            kind: kind.into(),
            payload,
        }));
    }

    pub fn send_leave_meeting(&self, reason: impl Into<String>) {
        self.command(Control::Send(OutboundMessage::LeaveMeeting {
            reason: reason.into(),
        }));
    }

    /// Ask the server to move the meeting to `phase`. Once sent, the local
    /// phase follows immediately.
    pub fn send_update_phase(&self, phase: MeetingPhase) {
        self.command(Control::Send(OutboundMessage::UpdatePhase { phase }));
    }

    pub fn send_update_shared_context(&self, shared_context: JsonObject) {
        self.command(Control::Send(OutboundMessage::UpdateSharedContext {
            shared_context,
        }));
    }

    /// Close the connection, cancel any pending reconnect and clear the
    /// cached state. Nothing reconnects until the next [`init`](Self::init).
    pub fn stop(&self) {
        self.command(Control::Stop);
    }

    /// Stop and wait for the session task to exit.
    pub async fn shutdown(&self) {
        self.command(Control::Shutdown);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Session task failed: {e}");
            }
        }
    }

    /// Register a listener. It receives the current snapshot before this
    /// returns and every later one in order.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.broadcast.subscribe(listener)
    }

    /// Snapshots as an async stream, starting with the current one.
    pub fn snapshots(&self) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.broadcast.subscribe(move |snapshot| {
            let _ = tx.send(snapshot.clone());
        });
        SnapshotStream {
            rx,
            _subscription: subscription,
        }
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.broadcast.latest()
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.counters;
        ClientStats {
            connect_attempts: c.connect_attempts.load(Ordering::Relaxed),
            connections_opened: c.connections_opened.load(Ordering::Relaxed),
            reconnects_scheduled: c.reconnects_scheduled.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            broadcast: self.broadcast.stats(),
        }
    }
}

/// Async view of the snapshot fan-out. Ends after the session task exits.
pub struct SnapshotStream {
    rx: mpsc::UnboundedReceiver<SessionSnapshot>,
    _subscription: Subscription,
}

impl SnapshotStream {
    pub async fn next(&mut self) -> Option<SessionSnapshot> {
        self.rx.recv().await
    }

    /// Wait for the first snapshot matching `predicate`.
    pub async fn wait_for<P>(&mut self, mut predicate: P) -> Option<SessionSnapshot>
    where
        P: FnMut(&SessionSnapshot) -> bool,
    {
        while let Some(snapshot) = self.rx.recv().await {
            if predicate(&snapshot) {
                return Some(snapshot);
            }
        }
        None
    }
}

type ConnectFuture =
    Pin<Box<dyn Future<Output = Result<Box<dyn Transport>, TransportError>> + Send>>;

/// The one connection slot.
enum Link {
    Idle,
    Connecting {
        generation: u64,
        attempt: ConnectFuture,
    },
    Open {
        generation: u64,
        transport: Box<dyn Transport>,
        heartbeat: Interval,
    },
    Backoff {
        timer: Pin<Box<Sleep>>,
    },
}

enum LinkEvent {
    Opened(Box<dyn Transport>),
    ConnectFailed(TransportError),
    Frame(String),
    Closed(CloseInfo),
    HeartbeatDue,
    RetryDue,
}

/// Next thing that happens on `link`. Cancel safe.
async fn poll_link(link: &mut Link) -> LinkEvent {
    match link {
        Link::Idle => std::future::pending().await,
        Link::Connecting { attempt, .. } => match attempt.as_mut().await {
            Ok(transport) => LinkEvent::Opened(transport),
            Err(e) => LinkEvent::ConnectFailed(e),
        },
        Link::Open {
            transport,
            heartbeat,
            ..
        } => {
            tokio::select! {
                incoming = transport.recv() => match incoming {
                    Incoming::Text(text) => LinkEvent::Frame(text),
                    Incoming::Closed(info) => LinkEvent::Closed(info),
                },
                _ = heartbeat.tick() => LinkEvent::HeartbeatDue,
            }
        }
        Link::Backoff { timer } => {
            timer.as_mut().await;
            LinkEvent::RetryDue
        }
    }
}

struct SessionDriver {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    control: mpsc::UnboundedReceiver<Control>,
    broadcast: Arc<SnapshotBroadcast>,
    counters: Arc<ClientCounters>,
    state: SessionState,
    policy: ReconnectPolicy,
    identity: Option<SessionIdentity>,
    stopped: bool,
    link: Link,
    generation: u64,
}

impl SessionDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Init(identity)) => self.init(identity).await,
                    Some(Control::Send(message)) => {
                        self.transmit(message).await;
                    }
                    Some(Control::Stop) => self.stop().await,
                    Some(Control::Shutdown) | None => {
                        self.stop().await;
                        break;
                    }
                },
                event = poll_link(&mut self.link) => self.on_link_event(event).await,
            }
        }
        self.broadcast.close();
        log::debug!("Session task exited");
    }

    async fn init(&mut self, identity: SessionIdentity) {
        if !identity.is_complete() {
            log::warn!("Ignoring init without meeting id and user id");
            return;
        }
        self.stopped = false;

        let same_meeting = self
            .identity
            .as_ref()
            .is_some_and(|current| current.same_meeting(&identity));
        let active = matches!(self.link, Link::Connecting { .. } | Link::Open { .. });
        self.identity = Some(identity);

        if same_meeting && active {
            log::debug!("Already joined or joining this meeting");
            return;
        }

        self.close_link(CLOSE_NORMAL, "Switching meeting").await;
        self.set_connection(ConnectionState::Disconnected);
        self.connect();
    }

    fn connect(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        log::info!(
            "Connecting to meeting {} as {} (#{generation})",
            identity.meeting_id,
            identity.user_id
        );
        ClientCounters::bump(&self.counters.connect_attempts);

        let connector = Arc::clone(&self.connector);
        self.link = Link::Connecting {
            generation,
            attempt: Box::pin(async move { connector.connect(&identity).await }),
        };
        self.set_connection(ConnectionState::Connecting);
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(transport) => self.on_open(transport).await,

            LinkEvent::ConnectFailed(e) => {
                log::warn!("Connection attempt failed: {e}");
                self.link = Link::Idle;
                self.set_connection(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }

            LinkEvent::Frame(text) => self.on_frame(&text),

            LinkEvent::Closed(info) => {
                self.link = Link::Idle;
                self.set_connection(ConnectionState::Disconnected);
                if info.is_clean() {
                    log::info!("Connection closed ({} {})", info.code, info.reason);
                    return;
                }
                log::warn!("Connection lost ({} {})", info.code, info.reason);
                self.schedule_reconnect();
            }

            LinkEvent::HeartbeatDue => {
                let phase = self.announced_phase();
                self.transmit(OutboundMessage::Heartbeat { phase }).await;
            }

            LinkEvent::RetryDue => {
                self.link = Link::Idle;
                self.connect();
            }
        }
    }

    async fn on_open(&mut self, transport: Box<dyn Transport>) {
        let generation = match self.link {
            Link::Connecting { generation, .. } => generation,
            _ => self.generation,
        };
        self.policy.reset();
        ClientCounters::bump(&self.counters.connections_opened);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.link = Link::Open {
            generation,
            transport,
            heartbeat,
        };
        log::info!("Connected (#{generation})");
        self.set_connection(ConnectionState::Connected);

        let Some(identity) = &self.identity else {
            return;
        };
        let join = OutboundMessage::JoinMeeting {
            role: identity.role,
            avatar_seed: identity.avatar_seed.clone(),
            phase: self.state.announced_phase(identity.initial_phase),
        };
        self.transmit(join).await;
    }

    fn on_frame(&mut self, text: &str) {
        ClientCounters::bump(&self.counters.frames_received);
        match InboundEvent::decode(text) {
            Ok(event) => {
                log::debug!("Received {}", event.kind());
                self.state.apply(event);
                self.publish();
            }
            Err(e) => {
                ClientCounters::bump(&self.counters.frames_dropped);
                log::warn!("Dropping inbound frame: {e}");
            }
        }
    }

    fn announced_phase(&self) -> MeetingPhase {
        let fallback = self
            .identity
            .as_ref()
            .map_or(MeetingPhase::Lobby, |identity| identity.initial_phase);
        self.state.announced_phase(fallback)
    }

    /// Write one message if the link is open. Never queues.
    async fn transmit(&mut self, message: OutboundMessage) -> bool {
        let Link::Open { transport, .. } = &mut self.link else {
            ClientCounters::bump(&self.counters.messages_dropped);
            log::warn!("Not connected; dropping {}", message.kind());
            return false;
        };

        let kind = message.kind().to_string();
        let phase_update = match &message {
            OutboundMessage::UpdatePhase { phase } => Some(*phase),
            _ => None,
        };
        let text = match message.into_envelope(&timestamp_now()).encode() {
            Ok(text) => text,
            Err(e) => {
                ClientCounters::bump(&self.counters.messages_dropped);
                log::warn!("Failed to encode {kind}: {e}");
                return false;
            }
        };
        if let Err(e) = transport.send(text).await {
            ClientCounters::bump(&self.counters.messages_dropped);
            log::warn!("Failed to send {kind}: {e}");
            return false;
        }
        ClientCounters::bump(&self.counters.messages_sent);
        log::debug!("Sent {kind}");

        if let Some(phase) = phase_update {
            self.state.set_phase(phase);
            self.publish();
        }
        true
    }

    fn schedule_reconnect(&mut self) {
        if self.stopped || self.identity.is_none() {
            return;
        }
        let delay = self.policy.next_delay();
        ClientCounters::bump(&self.counters.reconnects_scheduled);
        log::info!(
            "Reconnecting in {delay:?} (attempt {})",
            self.policy.attempts()
        );
        self.link = Link::Backoff {
            timer: Box::pin(sleep(delay)),
        };
    }

    /// Tear down the current link. Pending attempts and timers are dropped;
    /// an open channel gets a close frame, bounded by the close timeout.
    async fn close_link(&mut self, code: u16, reason: &str) {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Open {
                generation,
                mut transport,
                ..
            } => {
                log::info!("Closing connection #{generation}: {reason}");
                match timeout(self.config.close_timeout, transport.close(code, reason)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::debug!("Close handshake failed: {e}"),
                    Err(_) => log::debug!("Close handshake timed out"),
                }
            }
            Link::Connecting { generation, .. } => {
                log::debug!("Abandoning connection attempt #{generation}");
            }
            Link::Backoff { .. } => log::debug!("Cancelled pending reconnect"),
            Link::Idle => {}
        }
    }

    async fn stop(&mut self) {
        if self.stopped && matches!(self.link, Link::Idle) {
            return;
        }
        self.stopped = true;
        self.identity = None;
        self.close_link(CLOSE_NORMAL, "Client stopped").await;
        self.state.reset();
        self.publish();
        log::info!("Session stopped");
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.state.connection() != connection {
            self.state.set_connection(connection);
            self.publish();
        }
    }

    fn publish(&mut self) {
        self.broadcast.publish(self.state.snapshot());
    }
}

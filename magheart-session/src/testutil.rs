//! In-memory connector for driving the session client in unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::protocol::Envelope;
use crate::state::SessionIdentity;
use crate::transport::{CloseInfo, Connector, Incoming, Transport, TransportError};

/// What the next connection attempt does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Accept,
    Refuse,
    /// Never completes.
    Hang,
}

#[derive(Default)]
struct Shared {
    plans: Mutex<VecDeque<Plan>>,
    attempts: Mutex<Vec<(Instant, SessionIdentity)>>,
}

pub struct MockConnector {
    shared: Arc<Shared>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

/// Test-side view of a [`MockConnector`].
pub struct MockHandle {
    shared: Arc<Shared>,
    remotes: mpsc::UnboundedReceiver<RemoteEnd>,
}

pub fn mock_connector() -> (MockConnector, MockHandle) {
    let shared = Arc::new(Shared::default());
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockConnector {
            shared: Arc::clone(&shared),
            remotes: tx,
        },
        MockHandle {
            shared,
            remotes: rx,
        },
    )
}

impl MockHandle {
    /// Queue plans for upcoming attempts; unplanned attempts are accepted.
    pub fn plan(&self, plans: impl IntoIterator<Item = Plan>) {
        self.shared.plans.lock().unwrap().extend(plans);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.shared
            .attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn attempted_identities(&self) -> Vec<SessionIdentity> {
        self.shared
            .attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Gaps between consecutive attempts, in whole milliseconds.
    pub fn attempt_gaps_ms(&self) -> Vec<u128> {
        self.attempt_times()
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect()
    }

    /// Server side of the next accepted connection.
    pub async fn next_remote(&mut self) -> RemoteEnd {
        timeout(Duration::from_secs(120), self.remotes.recv())
            .await
            .expect("no connection accepted in time")
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.shared
            .attempts
            .lock()
            .unwrap()
            .push((Instant::now(), identity.clone()));
        let plan = self
            .shared
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Plan::Accept);

        match plan {
            Plan::Refuse => Err(TransportError::Closed),
            Plan::Hang => std::future::pending().await,
            Plan::Accept => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let closed = Arc::new(Mutex::new(None));
                let _ = self.remotes.send(RemoteEnd {
                    identity: identity.clone(),
                    inbound: inbound_tx,
                    outbound: outbound_rx,
                    closed: Arc::clone(&closed),
                });
                Ok(Box::new(MockTransport {
                    inbound: inbound_rx,
                    outbound: outbound_tx,
                    closed,
                }))
            }
        }
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Incoming>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<Mutex<Option<CloseInfo>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Incoming {
        match self.inbound.recv().await {
            Some(incoming) => incoming,
            None => Incoming::Closed(CloseInfo::abnormal("remote dropped")),
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        *self.closed.lock().unwrap() = Some(CloseInfo::new(code, reason));
        Ok(())
    }
}

/// Server side of one mock connection.
pub struct RemoteEnd {
    pub identity: SessionIdentity,
    inbound: mpsc::UnboundedSender<Incoming>,
    outbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<Mutex<Option<CloseInfo>>>,
}

impl RemoteEnd {
    pub fn push(&self, message: Value) {
        self.push_raw(&message.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.inbound.send(Incoming::Text(text.to_string()));
    }

    /// Close from the server side.
    pub fn close(&self, code: u16) {
        let _ = self
            .inbound
            .send(Incoming::Closed(CloseInfo::new(code, "closed by test")));
    }

    /// How the client closed this connection, if it did.
    pub fn closed_by_client(&self) -> Option<CloseInfo> {
        self.closed.lock().unwrap().clone()
    }

    /// Next envelope the client wrote.
    pub async fn next_sent(&mut self) -> Envelope {
        let text = timeout(Duration::from_secs(120), self.outbound.recv())
            .await
            .expect("client sent nothing in time")
            .expect("client side dropped");
        Envelope::decode(&text).expect("client sent malformed envelope")
    }

    /// Envelope already written, without waiting.
    pub fn try_sent(&mut self) -> Option<Envelope> {
        self.outbound
            .try_recv()
            .ok()
            .map(|text| Envelope::decode(&text).expect("client sent malformed envelope"))
    }
}

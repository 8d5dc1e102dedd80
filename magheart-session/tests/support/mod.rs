//! In-process meeting server for integration tests.
//!
//! Speaks the same JSON envelopes as the real backend: joins, heartbeats and
//! leaves trigger a `participants_state` resync, phase and shared-context
//! updates are echoed as `phase_changed` / `shared_context_updated`, and any
//! other event is relayed to the rest of the meeting.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use magheart_session::ClientConfig;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct Meeting {
    participants: Map<String, Value>,
    phase: Option<String>,
    shared_context: Option<Map<String, Value>>,
    peers: HashMap<u64, mpsc::UnboundedSender<String>>,
}

impl Meeting {
    fn state_message(&self) -> String {
        json!({
            "type": "participants_state",
            "payload": {
                "participants": self.participants,
                "phase": self.phase.as_deref().unwrap_or("lobby"),
                "sharedContext": self.shared_context,
            }
        })
        .to_string()
    }

    fn broadcast(&self, text: &str) {
        for peer in self.peers.values() {
            let _ = peer.send(text.to_string());
        }
    }

    fn broadcast_state(&self) {
        self.broadcast(&self.state_message());
    }
}

#[derive(Default)]
struct RelayState {
    meetings: HashMap<String, Meeting>,
}

pub struct MeetingRelay {
    port: u16,
    state: Arc<Mutex<RelayState>>,
    kick: broadcast::Sender<u16>,
    joins: Arc<AtomicUsize>,
}

impl MeetingRelay {
    /// Bind a free port and start accepting connections.
    pub async fn start() -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(RelayState::default()));
        let (kick, _) = broadcast::channel(16);
        let joins = Arc::new(AtomicUsize::new(0));
        let next_peer = Arc::new(AtomicU64::new(0));

        {
            let state = Arc::clone(&state);
            let kick = kick.clone();
            let joins = Arc::clone(&joins);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let peer_id = next_peer.fetch_add(1, Ordering::Relaxed);
                    let state = Arc::clone(&state);
                    let kick_rx = kick.subscribe();
                    let joins = Arc::clone(&joins);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_id, state, kick_rx, joins).await {
                            log::debug!("relay connection {peer_id} ended: {e}");
                        }
                    });
                }
            });
        }

        Self {
            port,
            state,
            kick,
            joins,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Client config pointed at this relay, with short backoff.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url(),
            reconnect_base: Duration::from_millis(100),
            reconnect_cap: Duration::from_millis(400),
            close_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        }
    }

    /// `join_meeting` messages received so far.
    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    /// Close every open connection with `code`.
    pub fn kick_all(&self, code: u16) {
        let _ = self.kick.send(code);
    }

    /// Inject a server-originated event into a meeting.
    pub fn push(&self, meeting_id: &str, event: Value) {
        let state = self.state.lock().unwrap();
        if let Some(meeting) = state.meetings.get(meeting_id) {
            meeting.broadcast(&event.to_string());
        }
    }

    pub fn participant_status(&self, meeting_id: &str, user_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .meetings
            .get(meeting_id)?
            .participants
            .get(user_id)?
            .get("status")?
            .as_str()
            .map(str::to_string)
    }
}

fn parse_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/cocreation/ws/")?;
    let (meeting, user) = rest.split_once('/')?;
    Some((meeting.to_string(), user.to_string()))
}

async fn handle_connection(
    stream: TcpStream,
    peer_id: u64,
    state: Arc<Mutex<RelayState>>,
    mut kick_rx: broadcast::Receiver<u16>,
    joins: Arc<AtomicUsize>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (meeting_id, user_id) = parse_path(&path).ok_or("bad path")?;
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    state
        .lock()
        .unwrap()
        .meetings
        .entry(meeting_id.clone())
        .or_default()
        .peers
        .insert(peer_id, out_tx);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_event(&state, &meeting_id, &user_id, peer_id, text.as_str(), &joins);
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            outgoing = out_rx.recv() => match outgoing {
                Some(text) => ws_sender.send(Message::Text(text.into())).await?,
                None => break,
            },
            code = kick_rx.recv() => {
                let code = code.unwrap_or(1011);
                let frame = CloseFrame { code: CloseCode::from(code), reason: "kicked".to_string().into() };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }

    let mut state = state.lock().unwrap();
    if let Some(meeting) = state.meetings.get_mut(&meeting_id) {
        meeting.peers.remove(&peer_id);
        if let Some(Value::Object(p)) = meeting.participants.get_mut(&user_id) {
            p.insert("status".into(), json!("offline"));
        }
        meeting.broadcast_state();
    }
    Ok(())
}

fn handle_event(
    state: &Mutex<RelayState>,
    meeting_id: &str,
    user_id: &str,
    peer_id: u64,
    text: &str,
    joins: &AtomicUsize,
) {
    let Ok(envelope) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let kind = envelope["type"].as_str().unwrap_or_default().to_string();
    let payload = envelope["payload"].as_object().cloned().unwrap_or_default();

    let mut state = state.lock().unwrap();
    let meeting = state.meetings.entry(meeting_id.to_string()).or_default();

    match kind.as_str() {
        "join_meeting" | "heartbeat" => {
            if kind == "join_meeting" {
                joins.fetch_add(1, Ordering::SeqCst);
            }
            let entry = meeting
                .participants
                .entry(user_id.to_string())
                .or_insert_with(|| json!({ "userId": user_id, "meetingId": meeting_id }));
            if let Value::Object(p) = entry {
                p.insert("status".into(), json!("online"));
                p.extend(payload);
            }
            meeting.broadcast_state();
        }
        "leave_meeting" => {
            meeting.participants.remove(user_id);
            meeting.broadcast_state();
        }
        "update_phase" => {
            let phase = payload.get("phase").and_then(Value::as_str).unwrap_or("lobby");
            meeting.phase = Some(phase.to_string());
            meeting.broadcast(
                &json!({
                    "type": "phase_changed",
                    "payload": { "meetingId": meeting_id, "phase": phase, "updatedBy": user_id }
                })
                .to_string(),
            );
            meeting.broadcast_state();
        }
        "update_shared_context" => {
            let updates = payload
                .get("sharedContext")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            if updates.is_empty() {
                return;
            }
            let ctx = meeting.shared_context.get_or_insert_with(Map::new);
            ctx.extend(updates);
            let ctx = ctx.clone();
            meeting.broadcast(
                &json!({
                    "type": "shared_context_updated",
                    "payload": { "meetingId": meeting_id, "sharedContext": ctx, "updatedBy": user_id }
                })
                .to_string(),
            );
            meeting.broadcast_state();
        }
        _ => {
            for (id, peer) in &meeting.peers {
                if *id != peer_id {
                    let _ = peer.send(text.to_string());
                }
            }
        }
    }
}

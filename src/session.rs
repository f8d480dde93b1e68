//! One websocket session per browser viewer.
//!
//! The session owns a [`DuelView`] for the connection's lifetime and relays
//! between the socket and the view:
//!
//! - client frames become reactions, chat lines, clips and player commands
//! - view updates (counts, chat, clips) are pushed back as JSON frames
//! - player commands issued through [`RemotePlayer`] are queued on a channel
//!   and written to the socket by the same loop
//!
//! Dropping the session drops the view, which releases every subscription.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::duel::{DuelSnapshot, DuelView, ViewTimings, ViewUpdate};
use crate::error::DuelError;
use crate::identity::{Identity, MemoryStorage, FINGERPRINT_KEY, USERNAME_KEY};
use crate::models::{DuelRoute, ReactionKind, Side};
use crate::player::{PlayerControl, Preset};
use crate::web::AppState;

/// Frames a browser may send. Anything else is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    React { side: Side, rtype: ReactionKind },
    Chat { text: String },
    Clip {
        side: Side,
        #[serde(default)]
        title: Option<String>,
    },
    PlayerReady { side: Side },
    Mute { side: Side },
    Unmute { side: Side },
    Volume { side: Side, value: f64 },
    Preset { name: String },
    Ping,
}

const CLIENT_TYPES: [&str; 9] = [
    "react",
    "chat",
    "clip",
    "player_ready",
    "mute",
    "unmute",
    "volume",
    "preset",
    "ping",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerCommand {
    Mute,
    Unmute,
    Volume,
}

/// Session-level frames. View updates travel as [`Frame::View`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        duel_id: String,
        fingerprint: String,
        username: String,
        cooldown_ms: u64,
        highlight_ms: u64,
        snapshot: DuelSnapshot,
    },
    Notice {
        message: String,
    },
    Player {
        side: Side,
        cmd: PlayerCommand,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u8>,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Anything written to the socket.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Frame {
    View(ViewUpdate),
    Server(ServerMessage),
}

impl From<ViewUpdate> for Frame {
    fn from(u: ViewUpdate) -> Self {
        Frame::View(u)
    }
}

impl From<ServerMessage> for Frame {
    fn from(m: ServerMessage) -> Self {
        Frame::Server(m)
    }
}

/// Player control handle for a widget living in the browser. Commands are
/// queued and flushed to the socket by the session loop.
pub struct RemotePlayer {
    side: Side,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl RemotePlayer {
    pub fn new(side: Side, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        RemotePlayer { side, tx }
    }

    fn push(&self, cmd: PlayerCommand, volume: Option<u8>) {
        // Receiver gone means the session is closing.
        let _ = self.tx.send(ServerMessage::Player {
            side: self.side,
            cmd,
            volume,
        });
    }
}

impl PlayerControl for RemotePlayer {
    fn mute(&mut self) {
        self.push(PlayerCommand::Mute, None);
    }

    fn unmute(&mut self) {
        self.push(PlayerCommand::Unmute, None);
    }

    fn set_volume(&mut self, volume: u8) {
        self.push(PlayerCommand::Volume, Some(volume));
    }
}

/// Resolve the viewer's identity from the `fp` and `user` query values the
/// browser keeps in its local storage. Missing values are generated.
pub fn identity_from_params(params: &HashMap<String, String>) -> Identity {
    let mut storage = MemoryStorage::seeded(&[
        (FINGERPRINT_KEY, params.get("fp").map(String::as_str)),
        (USERNAME_KEY, params.get("user").map(String::as_str)),
    ]);
    Identity::load(&mut storage)
}

pub fn welcome(view: &DuelView, timings: ViewTimings) -> ServerMessage {
    ServerMessage::Welcome {
        duel_id: view.duel_id().to_string(),
        fingerprint: view.identity().fingerprint.clone(),
        username: view.identity().username.clone(),
        cooldown_ms: timings.cooldown.as_millis() as u64,
        highlight_ms: timings.highlight.as_millis() as u64,
        snapshot: view.snapshot(),
    }
}

fn failure_frame(err: DuelError) -> Frame {
    match err {
        DuelError::CooldownActive { .. } | DuelError::EmptyMessage => {
            ServerMessage::Notice {
                message: err.to_string(),
            }
        }
        other => ServerMessage::Error {
            message: other.to_string(),
        },
    }
    .into()
}

/// Apply one text frame from the browser to the view and return the frames
/// to send back to that browser.
pub fn handle_client_text(
    view: &mut DuelView,
    text: &str,
    now: Instant,
    player_tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Vec<Frame> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let msg_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let msg: ClientMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) if CLIENT_TYPES.contains(&msg_type.as_str()) => {
            return vec![ServerMessage::Error {
                message: format!("bad {} message: {}", msg_type, e),
            }
            .into()];
        }
        Err(_) => return Vec::new(),
    };

    match msg {
        ClientMessage::React { side, rtype } => match view.react(side, rtype, now) {
            Ok(update) => vec![update.into()],
            Err(e) => vec![failure_frame(e)],
        },
        ClientMessage::Chat { text } => match view.say(&text) {
            // The insert notification delivers the line to every viewer.
            Ok(_) => Vec::new(),
            Err(e) => vec![failure_frame(e)],
        },
        ClientMessage::Clip { side, title } => match view.clip(side, title.as_deref()) {
            Ok(clip) => vec![ServerMessage::Notice {
                message: format!("Clip saved: {}", clip.title),
            }
            .into()],
            Err(e) => vec![failure_frame(e)],
        },
        ClientMessage::PlayerReady { side } => {
            let remote = RemotePlayer::new(side, player_tx.clone());
            view.players_mut().slot_mut(side).attach(Box::new(remote));
            Vec::new()
        }
        ClientMessage::Mute { side } => {
            view.players_mut().slot_mut(side).mute();
            Vec::new()
        }
        ClientMessage::Unmute { side } => {
            view.players_mut().slot_mut(side).unmute();
            Vec::new()
        }
        ClientMessage::Volume { side, value } => {
            view.players_mut().slot_mut(side).set_volume(value);
            Vec::new()
        }
        ClientMessage::Preset { name } => match name.parse::<Preset>() {
            Ok(preset) => {
                view.players_mut().apply_preset(preset);
                Vec::new()
            }
            Err(e) => vec![failure_frame(e)],
        },
        ClientMessage::Ping => vec![ServerMessage::Pong.into()],
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> bool
where
    S: SinkExt<WsMessage> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(WsMessage::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "frame serialization failed");
            true
        }
    }
}

/// Drive one viewer's websocket until either side goes away.
pub async fn handle_ws<S>(
    ws_stream: WebSocketStream<S>,
    state: AppState,
    route: DuelRoute,
    params: HashMap<String, String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timings = ViewTimings {
        cooldown: state.config.cooldown(),
        highlight: state.config.highlight(),
    };
    let identity = identity_from_params(&params);
    let mut view = DuelView::open(state.service.clone(), route, identity, timings);
    let (player_tx, mut player_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (mut ws_sink, mut ws_source) = ws_stream.split();

    if !send_frame(&mut ws_sink, &welcome(&view, timings).into()).await {
        return;
    }

    loop {
        tokio::select! {
            msg = ws_source.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let frames = handle_client_text(&mut view, &text, Instant::now(), &player_tx);
                        for frame in &frames {
                            if !send_frame(&mut ws_sink, frame).await {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(duel_id = %view.duel_id(), error = %e, "websocket read failed");
                        break;
                    }
                    _ => {}
                }
            }
            updates = view.next_updates() => {
                let Some(updates) = updates else { break };
                for update in updates {
                    if !send_frame(&mut ws_sink, &update.into()).await {
                        return;
                    }
                }
            }
            Some(cmd) = player_rx.recv() => {
                if !send_frame(&mut ws_sink, &cmd.into()).await {
                    break;
                }
            }
        }
    }

    tracing::info!(duel_id = %view.duel_id(), user = %view.identity().username, "viewer left");
}

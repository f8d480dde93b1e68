//! Crate-level error type.

use thiserror::Error;

/// Every failure the duel components and the binary can surface.
#[derive(Debug, Error)]
pub enum DuelError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid side '{0}' (expected left or right)")]
    InvalidSide(String),

    #[error("invalid reaction '{0}' (expected like or dislike)")]
    InvalidReaction(String),

    #[error("invalid preset '{0}' (expected mute_both, solo_left, solo_right or unmute_both)")]
    InvalidPreset(String),

    #[error("invalid duel route: {0}")]
    InvalidRoute(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("wait {remaining_ms} ms before reacting again")]
    CooldownActive { remaining_ms: u64 },

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DuelError>;

//! Row types shared by the data service, the view components and the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DuelError;

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current Unix epoch in whole seconds.
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Which half of the duel a reaction or clip belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = DuelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            _ => Err(DuelError::InvalidSide(s.to_string())),
        }
    }
}

/// The `rtype` column of a reaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Dislike,
}

impl ReactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionKind::Like => "like",
            ReactionKind::Dislike => "dislike",
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReactionKind {
    type Err = DuelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "like" => Ok(ReactionKind::Like),
            "dislike" => Ok(ReactionKind::Dislike),
            _ => Err(DuelError::InvalidReaction(s.to_string())),
        }
    }
}

/// Tables that emit change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Reactions,
    Messages,
    Clips,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Reactions => "reactions",
            Table::Messages => "messages",
            Table::Clips => "clips",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A live stream listed in the lobby. Never edited by the app itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub title: String,
    pub platform: String,
    pub url: String,
    #[serde(default)]
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: i64,
    pub duel_id: String,
    pub side: Side,
    pub rtype: ReactionKind,
    pub user_fingerprint: String,
    pub created_at_ms: u64,
}

/// Insert payload for the `reactions` table.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReaction {
    pub duel_id: String,
    pub side: Side,
    pub rtype: ReactionKind,
    pub user_fingerprint: String,
}

/// A chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub duel_id: String,
    pub username: String,
    pub content: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub duel_id: String,
    pub username: String,
    pub content: String,
}

/// A bookmarked moment on one side of a duel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: i64,
    pub duel_id: String,
    pub side: Side,
    pub title: String,
    pub ts_seconds: u64,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewClip {
    pub duel_id: String,
    pub side: Side,
    pub title: String,
    pub ts_seconds: u64,
}

/// Like/dislike tally for one side of a duel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub like: u32,
    pub dislike: u32,
}

impl Counts {
    /// Partition reaction rows by kind.
    pub fn tally<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a Reaction>,
    {
        rows.into_iter().fold(Counts::default(), |mut acc, r| {
            acc.bump(r.rtype);
            acc
        })
    }

    pub fn bump(&mut self, kind: ReactionKind) {
        match kind {
            ReactionKind::Like => self.like = self.like.saturating_add(1),
            ReactionKind::Dislike => self.dislike = self.dislike.saturating_add(1),
        }
    }

    pub fn plus(&self, other: &Counts) -> Counts {
        Counts {
            like: self.like.saturating_add(other.like),
            dislike: self.dislike.saturating_add(other.dislike),
        }
    }
}

// ---------------------------------------------------------------------------
// Duel routing
// ---------------------------------------------------------------------------

/// The two stream ids carried in the `s1`/`s2` query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuelRoute {
    pub left: String,
    pub right: String,
}

impl DuelRoute {
    pub fn new(left: &str, right: &str) -> Result<Self, DuelError> {
        let left = left.trim();
        let right = right.trim();
        if left.is_empty() || right.is_empty() {
            return Err(DuelError::InvalidRoute(
                "both s1 and s2 must name a stream".to_string(),
            ));
        }
        Ok(DuelRoute {
            left: left.to_string(),
            right: right.to_string(),
        })
    }

    /// Build a route from decoded query parameters.
    pub fn from_query(params: &std::collections::HashMap<String, String>) -> Result<Self, DuelError> {
        let s1 = params.get("s1").map(String::as_str).unwrap_or("");
        let s2 = params.get("s2").map(String::as_str).unwrap_or("");
        DuelRoute::new(s1, s2)
    }

    /// The grouping key shared by every row of this duel.
    pub fn duel_id(&self) -> String {
        format!("{}-{}", self.left, self.right)
    }

    pub fn stream_id(&self, side: Side) -> &str {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

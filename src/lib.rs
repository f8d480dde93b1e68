//! Duel Arena: two live streams side by side, with crowd reactions, chat
//! and clips shared in realtime between every viewer of the same duel.

pub mod chat;
pub mod cli;
pub mod config;
pub mod duel;
pub mod error;
pub mod identity;
pub mod lobby;
pub mod models;
pub mod player;
pub mod reactions;
pub mod realtime;
pub mod session;
pub mod store;
pub mod web;

pub use config::Config;
pub use duel::{DuelView, ViewTimings, ViewUpdate};
pub use error::{DuelError, Result};
pub use identity::Identity;
pub use models::{Clip, Counts, DuelRoute, Message, Reaction, ReactionKind, Side, Stream};
pub use realtime::ChangeFeed;
pub use store::{DataService, SqliteService};

//! Video player controls: per-player mute/volume state and guarded calls into
//! the third-party widget's control API.
//!
//! A slot has no control handle until its widget reports ready; every call
//! before that only updates local state.

use serde::Serialize;
use std::str::FromStr;

use crate::error::DuelError;
use crate::models::{Side, Stream};

pub const MAX_VOLUME: u8 = 100;
pub const DEFAULT_VOLUME: u8 = 50;

/// Imperative control surface of an embedded player widget.
pub trait PlayerControl: Send {
    fn mute(&mut self);
    fn unmute(&mut self);
    /// `volume` is always within `0..=MAX_VOLUME`.
    fn set_volume(&mut self, volume: u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlayerState {
    pub muted: bool,
    pub volume: u8,
}

impl Default for PlayerState {
    fn default() -> Self {
        PlayerState {
            muted: false,
            volume: DEFAULT_VOLUME,
        }
    }
}

/// Clamp an arbitrary slider value into `0..=MAX_VOLUME`.
pub fn clamp_volume(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, MAX_VOLUME as f64) as u8
}

#[derive(Default)]
pub struct PlayerSlot {
    state: PlayerState,
    control: Option<Box<dyn PlayerControl>>,
}

impl PlayerSlot {
    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.control.is_some()
    }

    /// Widget is ready: take its handle and push the current state to it.
    pub fn attach(&mut self, mut control: Box<dyn PlayerControl>) {
        control.set_volume(self.state.volume);
        if self.state.muted {
            control.mute();
        } else {
            control.unmute();
        }
        self.control = Some(control);
    }

    pub fn mute(&mut self) {
        self.state.muted = true;
        if let Some(c) = self.control.as_mut() {
            c.mute();
        }
    }

    pub fn unmute(&mut self) {
        self.state.muted = false;
        if let Some(c) = self.control.as_mut() {
            c.unmute();
        }
    }

    pub fn set_volume(&mut self, raw: f64) -> u8 {
        let volume = clamp_volume(raw);
        self.state.volume = volume;
        if let Some(c) = self.control.as_mut() {
            c.set_volume(volume);
        }
        volume
    }
}

/// Audio layouts offered next to the players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    MuteBoth,
    /// Hear only the left stream.
    SoloLeft,
    /// Hear only the right stream.
    SoloRight,
    UnmuteBoth,
}

impl FromStr for Preset {
    type Err = DuelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mute_both" => Ok(Preset::MuteBoth),
            "solo_left" => Ok(Preset::SoloLeft),
            "solo_right" => Ok(Preset::SoloRight),
            "unmute_both" => Ok(Preset::UnmuteBoth),
            other => Err(DuelError::InvalidPreset(other.to_string())),
        }
    }
}

/// The two players of a duel. No state is shared between them.
#[derive(Default)]
pub struct Players {
    left: PlayerSlot,
    right: PlayerSlot,
}

impl Players {
    pub fn slot(&self, side: Side) -> &PlayerSlot {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn slot_mut(&mut self, side: Side) -> &mut PlayerSlot {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn apply_preset(&mut self, preset: Preset) {
        let (left_muted, right_muted) = match preset {
            Preset::MuteBoth => (true, true),
            Preset::SoloLeft => (false, true),
            Preset::SoloRight => (true, false),
            Preset::UnmuteBoth => (false, false),
        };
        for (side, muted) in [(Side::Left, left_muted), (Side::Right, right_muted)] {
            let slot = self.slot_mut(side);
            if muted {
                slot.mute();
            } else {
                slot.unmute();
            }
        }
    }
}

/// Embeddable player URL for a stream, when its platform is recognised.
/// `parent` is the host name Twitch requires for embeds.
pub fn embed_url(stream: &Stream, parent: &str) -> Option<String> {
    let url = stream.url.trim();
    match stream.platform.to_lowercase().as_str() {
        "youtube" => youtube_id(url).map(|id| {
            format!("https://www.youtube.com/embed/{}?enablejsapi=1&controls=0", id)
        }),
        "twitch" => {
            let channel = url
                .split("twitch.tv/")
                .nth(1)?
                .split(['/', '?'])
                .next()
                .filter(|c| !c.is_empty())?;
            Some(format!(
                "https://player.twitch.tv/?channel={}&parent={}",
                channel, parent
            ))
        }
        _ => None,
    }
}

fn youtube_id(url: &str) -> Option<&str> {
    let tail = if let Some(idx) = url.find("v=") {
        &url[idx + 2..]
    } else if let Some(rest) = url.split("youtu.be/").nth(1) {
        rest
    } else if let Some(rest) = url.split("/embed/").nth(1) {
        rest
    } else {
        url.split("/live/").nth(1)?
    };
    tail.split(['&', '?', '/', '#']).next().filter(|id| !id.is_empty())
}

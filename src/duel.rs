//! Duel view: two players, two reaction counters, one chat panel and the
//! clip list, composed for a single viewer.
//!
//! The view owns every subscription it opens; dropping it unsubscribes all
//! of them. Local reactions are dispatched by the view to its counters
//! directly.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chat::ChatStream;
use crate::error::Result;
use crate::identity::Identity;
use crate::models::{now_secs, Clip, DuelRoute, Message, NewClip, ReactionKind, Side, Table};
use crate::player::{PlayerState, Players};
use crate::reactions::{submit_reaction, Cooldown, LocalReaction, ReactionCounter};
use crate::realtime::{ChangeEvent, Record, Subscription};
use crate::store::DataService;

pub const DEFAULT_CLIP_TITLE: &str = "Highlight moment";

/// Timing knobs of a view.
#[derive(Debug, Clone, Copy)]
pub struct ViewTimings {
    pub cooldown: Duration,
    pub highlight: Duration,
}

impl Default for ViewTimings {
    fn default() -> Self {
        ViewTimings {
            cooldown: crate::reactions::DEFAULT_COOLDOWN,
            highlight: crate::reactions::DEFAULT_HIGHLIGHT,
        }
    }
}

/// A change the viewer should render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewUpdate {
    Counts {
        side: Side,
        like: u32,
        dislike: u32,
        highlight: Option<ReactionKind>,
    },
    Chat {
        message: Message,
    },
    Clip {
        clip: Clip,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SideSnapshot {
    pub stream_id: String,
    pub like: u32,
    pub dislike: u32,
    pub player: PlayerState,
}

/// Full state of a view, sent when a viewer connects.
#[derive(Debug, Clone, Serialize)]
pub struct DuelSnapshot {
    pub duel_id: String,
    pub left: SideSnapshot,
    pub right: SideSnapshot,
    pub messages: Vec<Message>,
    pub clips: Vec<Clip>,
}

enum Woke {
    Counter(Side),
    Chat(ChangeEvent),
    Clip(ChangeEvent),
    Closed,
}

pub struct DuelView {
    route: DuelRoute,
    duel_id: String,
    identity: Identity,
    service: Arc<dyn DataService>,
    left: ReactionCounter,
    right: ReactionCounter,
    chat: ChatStream,
    clips: Vec<Clip>,
    clip_sub: Subscription,
    cooldown: Cooldown,
    players: Players,
}

impl DuelView {
    /// Subscribe every component, then load counts, chat and clips.
    pub fn open(
        service: Arc<dyn DataService>,
        route: DuelRoute,
        identity: Identity,
        timings: ViewTimings,
    ) -> Self {
        let duel_id = route.duel_id();
        let left = ReactionCounter::attach(service.clone(), &duel_id, Side::Left, timings.highlight);
        let right = ReactionCounter::attach(service.clone(), &duel_id, Side::Right, timings.highlight);
        let chat = ChatStream::attach(service.clone(), &duel_id, &identity.username);
        let clip_sub = service.subscribe(Table::Clips, &duel_id);

        let mut view = DuelView {
            route,
            duel_id,
            identity,
            service,
            left,
            right,
            chat,
            clips: Vec::new(),
            clip_sub,
            cooldown: Cooldown::new(timings.cooldown),
            players: Players::default(),
        };
        view.reload();
        tracing::info!(duel_id = %view.duel_id, user = %view.identity.username, "duel view opened");
        view
    }

    /// Authoritative reload of every component.
    pub fn reload(&mut self) {
        self.left.fetch_counts();
        self.right.fetch_counts();
        self.chat.load_messages();
        match self.service.select_clips(&self.duel_id) {
            Ok(clips) => self.clips = clips,
            Err(e) => tracing::error!(duel_id = %self.duel_id, error = %e, "clip load failed"),
        }
    }

    pub fn duel_id(&self) -> &str {
        &self.duel_id
    }

    pub fn route(&self) -> &DuelRoute {
        &self.route
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn counter(&self, side: Side) -> &ReactionCounter {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn counter_mut(&mut self, side: Side) -> &mut ReactionCounter {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.chat.messages()
    }

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn players(&self) -> &Players {
        &self.players
    }

    pub fn players_mut(&mut self) -> &mut Players {
        &mut self.players
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown.remaining(now)
    }

    fn counts_update(&self, side: Side, now: Instant) -> ViewUpdate {
        let counter = self.counter(side);
        let counts = counter.counts();
        ViewUpdate::Counts {
            side,
            like: counts.like,
            dislike: counts.dislike,
            highlight: counter.highlight(now),
        }
    }

    /// Submit a reaction as this viewer. On success the matching counter is
    /// bumped optimistically and its new state returned.
    pub fn react(&mut self, side: Side, rtype: ReactionKind, now: Instant) -> Result<ViewUpdate> {
        submit_reaction(
            self.service.as_ref(),
            &mut self.cooldown,
            now,
            &self.duel_id,
            side,
            rtype,
            &self.identity.fingerprint,
        )?;
        let local = LocalReaction { side, rtype };
        for s in Side::BOTH {
            self.counter_mut(s).on_local_reaction(&local, now);
        }
        Ok(self.counts_update(side, now))
    }

    /// Post a chat line as this viewer.
    pub fn say(&self, text: &str) -> Result<Message> {
        self.chat.send(text)
    }

    /// Bookmark the current moment on one side.
    pub fn clip(&self, side: Side, title: Option<&str>) -> Result<Clip> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_CLIP_TITLE);
        self.service
            .insert_clip(NewClip {
                duel_id: self.duel_id.clone(),
                side,
                title: title.to_string(),
                ts_seconds: now_secs(),
            })
            .map_err(|e| {
                tracing::error!(duel_id = %self.duel_id, %side, error = %e, "clip insert failed");
                e
            })
    }

    fn on_clip(&mut self, event: &ChangeEvent) -> Option<ViewUpdate> {
        let Record::Clips(clip) = event.record() else {
            return None;
        };
        if self.clips.iter().any(|c| c.id == clip.id) {
            return None;
        }
        self.clips.push(clip.clone());
        Some(ViewUpdate::Clip { clip: clip.clone() })
    }

    /// Process every pending notification.
    pub fn pump(&mut self, now: Instant) -> Vec<ViewUpdate> {
        let mut updates = Vec::new();
        for side in Side::BOTH {
            if self.counter_mut(side).sync() {
                updates.push(self.counts_update(side, now));
            }
        }
        updates.extend(
            self.chat
                .sync()
                .into_iter()
                .map(|message| ViewUpdate::Chat { message }),
        );
        while let Some(event) = self.clip_sub.try_next() {
            if let Some(update) = self.on_clip(&event) {
                updates.push(update);
            }
        }
        updates
    }

    /// Wait for the next notification on any component and return what
    /// changed. `None` once a channel has closed.
    pub async fn next_updates(&mut self) -> Option<Vec<ViewUpdate>> {
        let woke = tokio::select! {
            ev = self.left.next_change() => ev.map_or(Woke::Closed, |_| Woke::Counter(Side::Left)),
            ev = self.right.next_change() => ev.map_or(Woke::Closed, |_| Woke::Counter(Side::Right)),
            ev = self.chat.next_change() => ev.map_or(Woke::Closed, Woke::Chat),
            ev = self.clip_sub.recv() => ev.map_or(Woke::Closed, Woke::Clip),
        };
        let now = Instant::now();
        let mut updates = Vec::new();
        match woke {
            Woke::Counter(side) => {
                if self.counter_mut(side).fetch_counts() {
                    updates.push(self.counts_update(side, now));
                }
            }
            Woke::Chat(event) => {
                if let Some(message) = self.chat.on_insert(&event) {
                    updates.push(ViewUpdate::Chat {
                        message: message.clone(),
                    });
                }
            }
            Woke::Clip(event) => updates.extend(self.on_clip(&event)),
            Woke::Closed => return None,
        }
        updates.extend(self.pump(now));
        Some(updates)
    }

    pub fn snapshot(&self) -> DuelSnapshot {
        let side = |s: Side| {
            let counts = self.counter(s).counts();
            SideSnapshot {
                stream_id: self.route.stream_id(s).to_string(),
                like: counts.like,
                dislike: counts.dislike,
                player: self.players.slot(s).state(),
            }
        };
        DuelSnapshot {
            duel_id: self.duel_id.clone(),
            left: side(Side::Left),
            right: side(Side::Right),
            messages: self.chat.messages().to_vec(),
            clips: self.clips.clone(),
        }
    }
}

impl Drop for DuelView {
    fn drop(&mut self) {
        tracing::debug!(duel_id = %self.duel_id, "duel view closed");
    }
}

//! Like/dislike aggregation for one side of a duel.
//!
//! ## Design
//! - Tally: authoritative snapshot + provisional deltas. Displayed value is
//!   their sum; `apply_snapshot` replaces the snapshot and discards every delta
//! - ReactionCounter: owns a Tally and a reactions subscription for its duel;
//!   any insert notification triggers a full recount ("last fetch wins")
//! - Cooldown: client-only rate limit on submissions, started at the attempt
//!
//! ## Failure handling
//! A failed recount is logged and leaves the displayed value untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{DuelError, Result};
use crate::models::{Counts, NewReaction, Reaction, ReactionKind, Side, Table};
use crate::realtime::{ChangeEvent, Subscription};
use crate::store::DataService;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(2000);
pub const DEFAULT_HIGHLIGHT: Duration = Duration::from_millis(400);

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Counts as displayed: last authoritative snapshot plus local optimism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    snapshot: Counts,
    provisional: Counts,
}

impl Tally {
    pub fn displayed(&self) -> Counts {
        self.snapshot.plus(&self.provisional)
    }

    pub fn snapshot(&self) -> Counts {
        self.snapshot
    }

    pub fn provisional(&self) -> Counts {
        self.provisional
    }

    /// Record an optimistic +1 that the next snapshot will overwrite.
    pub fn bump(&mut self, kind: ReactionKind) {
        self.provisional.bump(kind);
    }

    /// Adopt an authoritative recount and drop all provisional deltas.
    pub fn apply_snapshot(&mut self, counts: Counts) {
        self.snapshot = counts;
        self.provisional = Counts::default();
    }
}

// ---------------------------------------------------------------------------
// Cooldown
// ---------------------------------------------------------------------------

/// Client-side submission window. Not enforced anywhere else.
#[derive(Debug, Clone)]
pub struct Cooldown {
    window: Duration,
    started: Option<Instant>,
}

impl Default for Cooldown {
    fn default() -> Self {
        Cooldown::new(DEFAULT_COOLDOWN)
    }
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Cooldown {
            window,
            started: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.started {
            Some(start) => self.window.saturating_sub(now.saturating_duration_since(start)),
            None => Duration::ZERO,
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        !self.remaining(now).is_zero()
    }

    /// Open a new window, or reject if one is still running.
    pub fn try_start(&mut self, now: Instant) -> Result<()> {
        let remaining = self.remaining(now);
        if !remaining.is_zero() {
            return Err(DuelError::CooldownActive {
                remaining_ms: remaining.as_millis().max(1) as u64,
            });
        }
        self.started = Some(now);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote operations
// ---------------------------------------------------------------------------

/// Count every stored reaction for (duel, side), partitioned by kind.
pub fn fetch_counts(service: &dyn DataService, duel_id: &str, side: Side) -> Result<Counts> {
    let rows = service.select_reactions(duel_id, side)?;
    Ok(Counts::tally(&rows))
}

/// Insert one reaction row, gated by `cooldown`. The window opens before the
/// insert and stays open even if the insert fails.
pub fn submit_reaction(
    service: &dyn DataService,
    cooldown: &mut Cooldown,
    now: Instant,
    duel_id: &str,
    side: Side,
    rtype: ReactionKind,
    fingerprint: &str,
) -> Result<Reaction> {
    cooldown.try_start(now)?;
    let stored = service.insert_reaction(NewReaction {
        duel_id: duel_id.to_string(),
        side,
        rtype,
        user_fingerprint: fingerprint.to_string(),
    });
    if let Err(ref e) = stored {
        tracing::error!(duel_id, %side, %rtype, error = %e, "reaction insert failed");
    }
    stored
}

/// A reaction this client just stored, dispatched to the matching counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalReaction {
    pub side: Side,
    pub rtype: ReactionKind,
}

// ---------------------------------------------------------------------------
// Counter component
// ---------------------------------------------------------------------------

/// Live counts for one side of a duel.
pub struct ReactionCounter {
    duel_id: String,
    side: Side,
    tally: Tally,
    highlight: Option<(ReactionKind, Instant)>,
    highlight_for: Duration,
    service: Arc<dyn DataService>,
    subscription: Subscription,
}

impl ReactionCounter {
    /// Subscribe to the duel's reaction inserts. Counts start at zero until
    /// the first `fetch_counts`.
    pub fn attach(
        service: Arc<dyn DataService>,
        duel_id: &str,
        side: Side,
        highlight_for: Duration,
    ) -> Self {
        let subscription = service.subscribe(Table::Reactions, duel_id);
        ReactionCounter {
            duel_id: duel_id.to_string(),
            side,
            tally: Tally::default(),
            highlight: None,
            highlight_for,
            service,
            subscription,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn duel_id(&self) -> &str {
        &self.duel_id
    }

    /// Displayed counts.
    pub fn counts(&self) -> Counts {
        self.tally.displayed()
    }

    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    /// Authoritative recount. Returns `false` (state untouched) on failure.
    pub fn fetch_counts(&mut self) -> bool {
        match fetch_counts(self.service.as_ref(), &self.duel_id, self.side) {
            Ok(counts) => {
                self.tally.apply_snapshot(counts);
                true
            }
            Err(e) => {
                tracing::error!(duel_id = %self.duel_id, side = %self.side, error = %e, "reaction recount failed");
                false
            }
        }
    }

    /// Apply an optimistic +1 if the reaction belongs to this side.
    pub fn on_local_reaction(&mut self, reaction: &LocalReaction, now: Instant) -> bool {
        if reaction.side != self.side {
            return false;
        }
        self.tally.bump(reaction.rtype);
        self.highlight = Some((reaction.rtype, now + self.highlight_for));
        true
    }

    /// The bucket to emphasise right now, if any.
    pub fn highlight(&self, now: Instant) -> Option<ReactionKind> {
        match self.highlight {
            Some((kind, until)) if now < until => Some(kind),
            _ => None,
        }
    }

    /// Drain pending notifications; recount once if any arrived.
    pub fn sync(&mut self) -> bool {
        let mut pending = 0usize;
        while self.subscription.try_next().is_some() {
            pending += 1;
        }
        if pending == 0 {
            return false;
        }
        tracing::debug!(duel_id = %self.duel_id, side = %self.side, pending, "reactions changed");
        self.fetch_counts()
    }

    /// Wait for the next reaction insert on this duel.
    pub async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.subscription.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ChangeFeed;
    use crate::store::testing::FlakyService;
    use crate::store::SqliteService;
    use proptest::prelude::*;

    fn service() -> Arc<dyn DataService> {
        Arc::new(SqliteService::in_memory(ChangeFeed::default()).unwrap())
    }

    fn insert(svc: &dyn DataService, duel: &str, side: Side, rtype: ReactionKind) {
        svc.insert_reaction(NewReaction {
            duel_id: duel.to_string(),
            side,
            rtype,
            user_fingerprint: "someone-else".to_string(),
        })
        .unwrap();
    }

    // -- Tally ---------------------------------------------------------------

    #[test]
    fn test_tally_displayed_adds_provisional() {
        let mut t = Tally::default();
        t.apply_snapshot(Counts { like: 3, dislike: 1 });
        t.bump(ReactionKind::Like);
        assert_eq!(t.displayed(), Counts { like: 4, dislike: 1 });
    }

    #[test]
    fn test_tally_snapshot_discards_provisional() {
        let mut t = Tally::default();
        t.bump(ReactionKind::Dislike);
        t.bump(ReactionKind::Dislike);
        t.apply_snapshot(Counts { like: 0, dislike: 1 });
        assert_eq!(t.provisional(), Counts::default());
        assert_eq!(t.displayed(), Counts { like: 0, dislike: 1 });
    }

    // -- Cooldown ------------------------------------------------------------

    #[test]
    fn test_cooldown_initially_inactive() {
        let c = Cooldown::default();
        assert!(!c.is_active(Instant::now()));
        assert_eq!(c.window(), DEFAULT_COOLDOWN);
    }

    #[test]
    fn test_cooldown_rejects_inside_window() {
        let mut c = Cooldown::new(Duration::from_secs(2));
        let t0 = Instant::now();
        c.try_start(t0).unwrap();
        match c.try_start(t0 + Duration::from_millis(500)) {
            Err(DuelError::CooldownActive { remaining_ms }) => assert_eq!(remaining_ms, 1500),
            other => panic!("expected cooldown rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_cooldown_allows_after_window() {
        let mut c = Cooldown::new(Duration::from_secs(2));
        let t0 = Instant::now();
        c.try_start(t0).unwrap();
        assert!(c.try_start(t0 + Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_cooldown_rejection_does_not_extend_window() {
        let mut c = Cooldown::new(Duration::from_secs(2));
        let t0 = Instant::now();
        c.try_start(t0).unwrap();
        let _ = c.try_start(t0 + Duration::from_millis(1900));
        assert!(c.try_start(t0 + Duration::from_millis(2000)).is_ok());
    }

    // -- submit_reaction -----------------------------------------------------

    #[test]
    fn test_submit_reaction_stores_row() {
        let svc = service();
        let mut cooldown = Cooldown::default();
        let stored = submit_reaction(
            svc.as_ref(),
            &mut cooldown,
            Instant::now(),
            "a-b",
            Side::Left,
            ReactionKind::Like,
            "fp-1",
        )
        .unwrap();
        assert_eq!(stored.user_fingerprint, "fp-1");
        assert_eq!(fetch_counts(svc.as_ref(), "a-b", Side::Left).unwrap(), Counts { like: 1, dislike: 0 });
    }

    #[test]
    fn test_submit_within_cooldown_stores_nothing() {
        let svc = service();
        let mut cooldown = Cooldown::default();
        let t0 = Instant::now();
        submit_reaction(svc.as_ref(), &mut cooldown, t0, "a-b", Side::Left, ReactionKind::Like, "fp").unwrap();
        let second = submit_reaction(
            svc.as_ref(),
            &mut cooldown,
            t0 + Duration::from_millis(100),
            "a-b",
            Side::Right,
            ReactionKind::Dislike,
            "fp",
        );
        assert!(matches!(second, Err(DuelError::CooldownActive { .. })));
        assert_eq!(fetch_counts(svc.as_ref(), "a-b", Side::Right).unwrap(), Counts::default());
    }

    #[test]
    fn test_failed_insert_still_starts_cooldown() {
        let flaky = FlakyService::new();
        flaky.set_failing(true);
        let mut cooldown = Cooldown::default();
        let t0 = Instant::now();
        let res = submit_reaction(flaky.as_ref(), &mut cooldown, t0, "a-b", Side::Left, ReactionKind::Like, "fp");
        assert!(res.is_err());
        assert!(cooldown.is_active(t0 + Duration::from_millis(10)));
    }

    // -- ReactionCounter -----------------------------------------------------

    #[test]
    fn test_counter_fetch_counts_matches_rows() {
        let svc = service();
        insert(svc.as_ref(), "a-b", Side::Left, ReactionKind::Like);
        insert(svc.as_ref(), "a-b", Side::Left, ReactionKind::Dislike);
        insert(svc.as_ref(), "a-b", Side::Right, ReactionKind::Like);
        let mut counter = ReactionCounter::attach(svc, "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        assert_eq!(counter.counts(), Counts::default());
        assert!(counter.fetch_counts());
        assert_eq!(counter.counts(), Counts { like: 1, dislike: 1 });
    }

    #[test]
    fn test_counter_failed_fetch_keeps_previous_state() {
        let flaky = FlakyService::new();
        let svc: Arc<dyn DataService> = flaky.clone();
        insert(svc.as_ref(), "a-b", Side::Left, ReactionKind::Like);
        let mut counter = ReactionCounter::attach(svc, "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        counter.fetch_counts();
        flaky.set_failing(true);
        assert!(!counter.fetch_counts());
        assert_eq!(counter.counts(), Counts { like: 1, dislike: 0 });
    }

    #[test]
    fn test_local_reaction_increments_matching_side_only() {
        let svc = service();
        let mut left = ReactionCounter::attach(svc.clone(), "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        let mut right = ReactionCounter::attach(svc, "a-b", Side::Right, DEFAULT_HIGHLIGHT);
        let ev = LocalReaction { side: Side::Left, rtype: ReactionKind::Like };
        let now = Instant::now();
        assert!(left.on_local_reaction(&ev, now));
        assert!(!right.on_local_reaction(&ev, now));
        assert_eq!(left.counts(), Counts { like: 1, dislike: 0 });
        assert_eq!(right.counts(), Counts::default());
    }

    #[test]
    fn test_highlight_expires() {
        let svc = service();
        let mut counter = ReactionCounter::attach(svc, "a-b", Side::Left, Duration::from_millis(400));
        let t0 = Instant::now();
        counter.on_local_reaction(&LocalReaction { side: Side::Left, rtype: ReactionKind::Dislike }, t0);
        assert_eq!(counter.highlight(t0 + Duration::from_millis(100)), Some(ReactionKind::Dislike));
        assert_eq!(counter.highlight(t0 + Duration::from_millis(400)), None);
    }

    #[test]
    fn test_sync_without_notifications_does_nothing() {
        let svc = service();
        let mut counter = ReactionCounter::attach(svc, "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        assert!(!counter.sync());
    }

    #[test]
    fn test_sync_recounts_after_insert_on_either_side() {
        let svc = service();
        let mut counter = ReactionCounter::attach(svc.clone(), "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        insert(svc.as_ref(), "a-b", Side::Left, ReactionKind::Like);
        insert(svc.as_ref(), "a-b", Side::Right, ReactionKind::Like);
        assert!(counter.sync());
        assert_eq!(counter.counts(), Counts { like: 1, dislike: 0 });
        assert!(!counter.sync(), "notifications were drained");
    }

    #[test]
    fn test_sync_ignores_other_duels() {
        let svc = service();
        let mut counter = ReactionCounter::attach(svc.clone(), "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        insert(svc.as_ref(), "c-d", Side::Left, ReactionKind::Like);
        assert!(!counter.sync());
    }

    #[test]
    fn test_recount_overwrites_optimistic_value() {
        let svc = service();
        let mut counter = ReactionCounter::attach(svc.clone(), "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        let now = Instant::now();
        // Two optimistic bumps, but only one row actually lands.
        counter.on_local_reaction(&LocalReaction { side: Side::Left, rtype: ReactionKind::Like }, now);
        counter.on_local_reaction(&LocalReaction { side: Side::Left, rtype: ReactionKind::Like }, now);
        insert(svc.as_ref(), "a-b", Side::Left, ReactionKind::Like);
        counter.sync();
        assert_eq!(counter.counts(), Counts { like: 1, dislike: 0 });
    }

    #[test]
    fn test_drop_counter_unsubscribes() {
        let feed = ChangeFeed::default();
        let svc: Arc<dyn DataService> = Arc::new(SqliteService::in_memory(feed.clone()).unwrap());
        let counter = ReactionCounter::attach(svc, "a-b", Side::Left, DEFAULT_HIGHLIGHT);
        assert_eq!(feed.subscriber_count(Table::Reactions, "a-b"), 1);
        drop(counter);
        assert_eq!(feed.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_next_change_resolves_on_insert() {
        let svc = service();
        let mut counter = ReactionCounter::attach(svc.clone(), "a-b", Side::Right, DEFAULT_HIGHLIGHT);
        insert(svc.as_ref(), "a-b", Side::Right, ReactionKind::Dislike);
        let ev = tokio::time::timeout(Duration::from_millis(500), counter.next_change())
            .await
            .expect("timeout");
        assert!(ev.is_some());
        assert!(counter.fetch_counts());
        assert_eq!(counter.counts().dislike, 1);
    }

    proptest! {
        #[test]
        fn prop_optimistic_counts_monotonic_until_recount(kinds in proptest::collection::vec(any::<bool>(), 0..40)) {
            let svc = service();
            let mut counter = ReactionCounter::attach(svc.clone(), "a-b", Side::Left, DEFAULT_HIGHLIGHT);
            let now = Instant::now();
            let mut prev = counter.counts();
            for like in &kinds {
                let rtype = if *like { ReactionKind::Like } else { ReactionKind::Dislike };
                insert(svc.as_ref(), "a-b", Side::Left, rtype);
                counter.on_local_reaction(&LocalReaction { side: Side::Left, rtype }, now);
                let cur = counter.counts();
                prop_assert!(cur.like >= prev.like && cur.dislike >= prev.dislike);
                prev = cur;
            }
            counter.sync();
            let likes = kinds.iter().filter(|k| **k).count() as u32;
            prop_assert_eq!(counter.counts(), Counts { like: likes, dislike: kinds.len() as u32 - likes });
        }
    }
}

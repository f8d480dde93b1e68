//! Lobby: stream listing and the two-slot duel selection.

use crate::models::{DuelRoute, Stream};
use crate::store::DataService;
use crate::web::url_encode;

/// Maximum number of streams that can be picked for a duel.
pub const MAX_SELECTED: usize = 2;

#[derive(Debug, Default, Clone)]
pub struct Lobby {
    streams: Vec<Stream>,
    selected: Vec<String>,
}

impl Lobby {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch every known stream. On failure the current list is kept.
    pub fn load(&mut self, service: &dyn DataService) -> bool {
        match service.list_streams() {
            Ok(streams) => {
                self.streams = streams;
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "stream list failed");
                false
            }
        }
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.iter().any(|s| s == id)
    }

    /// Deselect a picked stream, or pick it while there is room. Picking a
    /// third stream leaves the selection unchanged. Returns whether the
    /// selection changed.
    pub fn toggle(&mut self, id: &str) -> bool {
        if let Some(pos) = self.selected.iter().position(|s| s == id) {
            self.selected.remove(pos);
            return true;
        }
        if self.selected.len() < MAX_SELECTED {
            self.selected.push(id.to_string());
            return true;
        }
        false
    }

    /// The duel both picks lead to, once exactly two are selected.
    pub fn duel_route(&self) -> Option<DuelRoute> {
        match self.selected.as_slice() {
            [a, b] => DuelRoute::new(a, b).ok(),
            _ => None,
        }
    }

    /// Navigation target for the duel page.
    pub fn duel_link(&self) -> Option<String> {
        self.duel_route().map(|r| duel_path(&r))
    }
}

/// `/duel?s1=..&s2=..` for a route.
pub fn duel_path(route: &DuelRoute) -> String {
    format!("/duel?s1={}&s2={}", url_encode(&route.left), url_encode(&route.right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ChangeFeed;
    use crate::store::testing::FlakyService;
    use crate::store::SqliteService;

    fn stream(id: &str) -> Stream {
        Stream {
            id: id.to_string(),
            title: format!("Stream {}", id),
            platform: "twitch".to_string(),
            url: format!("https://twitch.tv/{}", id),
            is_live: true,
        }
    }

    #[test]
    fn test_load_lists_streams() {
        let svc = SqliteService::in_memory(ChangeFeed::default()).unwrap();
        svc.upsert_stream(&stream("a")).unwrap();
        svc.upsert_stream(&stream("b")).unwrap();
        let mut lobby = Lobby::new();
        assert!(lobby.load(&svc));
        assert_eq!(lobby.streams().len(), 2);
    }

    #[test]
    fn test_load_failure_keeps_list() {
        let flaky = FlakyService::new();
        flaky.upsert_stream(&stream("a")).unwrap();
        let mut lobby = Lobby::new();
        lobby.load(flaky.as_ref());
        flaky.set_failing(true);
        assert!(!lobby.load(flaky.as_ref()));
        assert_eq!(lobby.streams().len(), 1);
    }

    #[test]
    fn test_toggle_selects_and_deselects() {
        let mut lobby = Lobby::new();
        assert!(lobby.toggle("a"));
        assert!(lobby.is_selected("a"));
        assert!(lobby.toggle("a"));
        assert!(lobby.selected().is_empty());
    }

    #[test]
    fn test_third_selection_is_noop() {
        let mut lobby = Lobby::new();
        lobby.toggle("a");
        lobby.toggle("b");
        assert!(!lobby.toggle("c"));
        assert_eq!(lobby.selected(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_deselect_frees_a_slot() {
        let mut lobby = Lobby::new();
        lobby.toggle("a");
        lobby.toggle("b");
        lobby.toggle("a");
        assert!(lobby.toggle("c"));
        assert_eq!(lobby.selected(), &["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_duel_link_requires_two() {
        let mut lobby = Lobby::new();
        assert!(lobby.duel_link().is_none());
        lobby.toggle("a");
        assert!(lobby.duel_link().is_none());
        lobby.toggle("b");
        assert_eq!(lobby.duel_link().unwrap(), "/duel?s1=a&s2=b");
        assert_eq!(lobby.duel_route().unwrap().duel_id(), "a-b");
    }

    #[test]
    fn test_duel_link_encodes_ids() {
        let route = DuelRoute::new("a b", "c&d").unwrap();
        assert_eq!(duel_path(&route), "/duel?s1=a%20b&s2=c%26d");
    }
}

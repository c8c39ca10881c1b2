//! The channel table: user-event subscriptions matched against inbound
//! events by (cached) regular expression.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::Discover;

/// A user subscription callback. The `void *user` pointer of the original
/// protocol vanishes here — callers close over whatever state they need.
pub type ChannelHandler = Arc<dyn Fn(&Discover, &str, &Value) + Send + Sync>;

struct Channel {
    event: String,
    handler: ChannelHandler,
}

/// Ordered collection of subscriptions, scanned in insertion order on every
/// dispatch. Compiled patterns are cached so repeated dispatch doesn't
/// recompile a pattern on every inbound datagram; a pattern that fails to
/// compile is cached as `None` so it's skipped (not retried) on every call.
#[derive(Default)]
pub struct ChannelTable {
    channels: Vec<Channel>,
    compiled: HashMap<String, Option<regex::Regex>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `event`. A byte-exact match on an existing pattern
    /// replaces its handler in place rather than adding a duplicate entry.
    pub fn join(&mut self, event: &str, handler: ChannelHandler) {
        if let Some(existing) = self.channels.iter_mut().find(|c| c.event == event) {
            existing.handler = handler;
            return;
        }
        self.channels.push(Channel {
            event: event.to_string(),
            handler,
        });
    }

    /// Remove the first subscription whose stored pattern equals `event`
    /// byte-exactly.
    pub fn leave(&mut self, event: &str) {
        if let Some(pos) = self.channels.iter().position(|c| c.event == event) {
            self.channels.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn regex_for(&mut self, pattern: &str) -> Option<&regex::Regex> {
        self.compiled
            .entry(pattern.to_string())
            .or_insert_with(|| regex::Regex::new(pattern).ok())
            .as_ref()
    }

    /// Invoke every subscription whose pattern matches `event_name`, in
    /// subscription order. A subscription whose pattern fails to compile is
    /// skipped for this (and every) dispatch, silently.
    pub fn dispatch(&mut self, discover: &Discover, event_name: &str, value: &Value) {
        // Pre-resolve matches to avoid mutably borrowing `self.compiled`
        // while holding a reference to `self.channels`.
        let matches: Vec<ChannelHandler> = self
            .channels
            .iter()
            .filter_map(|c| {
                let event = c.event.clone();
                let matched = self
                    .compiled
                    .entry(event.clone())
                    .or_insert_with(|| regex::Regex::new(&event).ok())
                    .as_ref()
                    .map(|re| re.is_match(event_name))
                    .unwrap_or(false);
                matched.then(|| c.handler.clone())
            })
            .collect();

        for handler in matches {
            handler(discover, event_name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mk_discover() -> Discover {
        Discover::builder().build().expect("build")
    }

    #[test]
    fn join_then_leave_removes_subscription() {
        let mut table = ChannelTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        table.join("test", Arc::new(move |_, _, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(table.len(), 1);
        table.leave("test");
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn second_join_with_same_pattern_replaces_handler() {
        let mut table = ChannelTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_a = hits.clone();
        table.join("te.*", Arc::new(move |_, _, _| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        }));
        let hits_b = hits.clone();
        table.join("te.*", Arc::new(move |_, _, _| {
            hits_b.fetch_add(100, Ordering::SeqCst);
        }));
        assert_eq!(table.len(), 1);

        let discover = mk_discover();
        table.dispatch(&discover, "test", &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn regex_match_invokes_handler_exactly_once() {
        let mut table = ChannelTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        table.join("te.*", Arc::new(move |_, name, _| {
            assert_eq!(name, "test");
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        let discover = mk_discover();
        table.dispatch(&discover, "test", &Value::Null);
        table.dispatch(&discover, "other", &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_pattern_is_skipped_not_fatal() {
        let mut table = ChannelTable::new();
        table.join("(unclosed", Arc::new(|_, _, _| panic!("should never be called")));
        let discover = mk_discover();
        table.dispatch(&discover, "anything", &Value::Null);
    }
}

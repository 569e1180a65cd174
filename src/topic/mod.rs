//! Topic matching and subscription management
//!
//! The forwarding engine registers every forwarder topic as a member of a
//! synthetic shared group (`forwarder#<id>`) so that each matching local
//! publish lands in exactly one queue per forwarder. [`TopicMatcher`] is the
//! contract the engine relies on; [`SubscriptionStore`] is the in-memory
//! trie-backed implementation.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name, TopicError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::message::QoS;

/// Subscription options stored with a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionFlags {
    pub qos: QoS,
    /// Don't deliver messages published by the subscribing client itself
    pub no_local: bool,
    pub retain_as_published: bool,
}

/// A subscriber matched against a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    /// The filter the subscriber registered (not the matched topic)
    pub filter: Arc<str>,
    pub flags: SubscriptionFlags,
    pub shared_group: Option<Arc<str>>,
}

impl Subscriber {
    /// Key of the shared queue this subscriber consumes: `<group>/<filter>`
    pub fn shared_queue_id(&self) -> Option<String> {
        self.shared_group
            .as_ref()
            .map(|group| format!("{}/{}", group, self.filter))
    }
}

/// Registry of (client, topic filter, shared group) subscriptions
pub trait TopicMatcher: Send + Sync {
    /// Add or replace a subscriber, returning whether it already existed
    fn add_subscriber(
        &self,
        client_id: &str,
        topic_filter: &str,
        flags: SubscriptionFlags,
        shared_group: Option<&str>,
    ) -> bool;

    /// Remove a subscriber, returning whether it existed
    fn remove_subscriber(
        &self,
        client_id: &str,
        topic_filter: &str,
        shared_group: Option<&str>,
    ) -> bool;

    /// Subscribers for a topic: every non-shared subscriber, one per shared group
    fn matches(&self, topic: &str) -> SmallVec<[Subscriber; 8]>;
}

/// Thread-safe subscription store using a topic trie
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscriber>>>,
    /// Round-robin counters for shared groups
    share_counters: DashMap<Arc<str>, AtomicUsize>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            share_counters: DashMap::new(),
        }
    }

    fn same_member(sub: &Subscriber, client_id: &str, shared_group: Option<&str>) -> bool {
        sub.client_id.as_ref() == client_id && sub.shared_group.as_deref() == shared_group
    }

    /// Number of registered subscribers across all filters
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.trie
            .read()
            .for_each_value(|subs| count += subs.len());
        count
    }

    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }
}

impl TopicMatcher for SubscriptionStore {
    fn add_subscriber(
        &self,
        client_id: &str,
        topic_filter: &str,
        flags: SubscriptionFlags,
        shared_group: Option<&str>,
    ) -> bool {
        if let Some(group) = shared_group {
            self.share_counters
                .entry(group.into())
                .or_insert_with(|| AtomicUsize::new(0));
        }

        let subscriber = Subscriber {
            client_id: client_id.into(),
            filter: topic_filter.into(),
            flags,
            shared_group: shared_group.map(Into::into),
        };

        let mut trie = self.trie.write();
        let subs = trie.entry_or_insert_with(topic_filter, Vec::new);
        if let Some(existing) = subs
            .iter_mut()
            .find(|s| Self::same_member(s, client_id, shared_group))
        {
            *existing = subscriber;
            return true;
        }
        subs.push(subscriber);
        false
    }

    fn remove_subscriber(
        &self,
        client_id: &str,
        topic_filter: &str,
        shared_group: Option<&str>,
    ) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(topic_filter) else {
            return false;
        };

        let len_before = subs.len();
        subs.retain(|s| !Self::same_member(s, client_id, shared_group));
        let removed = subs.len() != len_before;
        if subs.is_empty() {
            trie.remove(topic_filter);
        }
        removed
    }

    fn matches(&self, topic: &str) -> SmallVec<[Subscriber; 8]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscriber; 8]> = SmallVec::new();
        let mut share_groups: AHashMap<Arc<str>, SmallVec<[Subscriber; 4]>> = AHashMap::new();

        trie.matches(topic, |subs| {
            for sub in subs {
                match sub.shared_group {
                    Some(ref group) => share_groups
                        .entry(group.clone())
                        .or_default()
                        .push(sub.clone()),
                    None => result.push(sub.clone()),
                }
            }
        });

        for (group, mut members) in share_groups {
            let counter = self
                .share_counters
                .entry(group)
                .or_insert_with(|| AtomicUsize::new(0));
            let idx = counter.fetch_add(1, Ordering::Relaxed) % members.len();
            result.push(members.swap_remove(idx));
        }

        result
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

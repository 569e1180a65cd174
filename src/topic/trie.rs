//! Topic Trie for subscription matching
//!
//! A prefix tree keyed by topic level, with dedicated slots for the `+` and
//! `#` wildcards so a topic can be matched against every filter in one walk.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending exactly at this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `#` at this node
    multi_wildcard: Option<V>,
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }
}

impl<V> TrieNode<V> {
    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

/// Topic Trie mapping topic filters to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
        }
    }

    /// Get the value for a filter, inserting one built by `init` if absent
    pub fn entry_or_insert_with<F>(&mut self, filter: &str, init: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.get_or_insert_with(init);
            }

            node = if level == "+" {
                &mut **node.single_wildcard.get_or_insert_with(Default::default)
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                return node.value.get_or_insert_with(init);
            }
        }

        // `split` always yields at least one level
        node.value.get_or_insert_with(init)
    }

    /// Get a mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.as_mut();
            }

            node = if level == "+" {
                node.single_wildcard.as_deref_mut()?
            } else {
                node.children.get_mut(level)?
            };

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a filter, pruning nodes left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match *level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(*level)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(*level);
                }
                removed
            }
        }
    }

    /// Invoke `callback` for the value of every filter matching `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let is_system_topic = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        // $-topics never match a leading wildcard
        let wildcards_allowed = !(is_system_topic && index == 0);

        if wildcards_allowed {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        let Some(level) = levels.get(index) else {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        };

        if wildcards_allowed {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(*level) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }

    /// Visit every stored value
    pub fn for_each_value<F>(&self, mut f: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut f);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, f: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            f(v);
        }
        if let Some(ref v) = node.multi_wildcard {
            f(v);
        }
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_recursive(child, f);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, f);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

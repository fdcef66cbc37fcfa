/*
    Copyright 2024 MydriaTech AB

    Licensed under the Apache License 2.0 with Free world makers exception
    1.0.0 (the "License"); you may not use this file except in compliance with
    the License. You should have obtained a copy of the License with the source
    or binary distribution in file named

        LICENSE-Apache-2.0-with-FWM-Exception-1.0.0

    Unless required by applicable law or agreed to in writing, software
    distributed under the License is distributed on an "AS IS" BASIS,
    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
    See the License for the specific language governing permissions and
    limitations under the License.
*/

//! Concurrent `(host, path) -> targets` cache mirrored from ingress resources.
//!
//! One path trie per host, guarded by its own reader-writer lock; the host
//! map itself is a [crossbeam_skiplist::SkipMap] so independent hosts never
//! contend with each other, following the same per-level `SkipMap` shape
//! `mydriatech-microfefind` uses for its flat host+path cache
//! (`ingress_monitor.rs`), generalized here to a genuine path trie with
//! longest-prefix match and to `Target::{Single,Pair}` for canary support.

use crossbeam_skiplist::SkipMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors raised by [IngressHostCache] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// No trie is registered for the requested host.
    #[error("host not found")]
    HostNotFound,
    /// No stored prefix (including the `"/"` fallback) covers the requested path.
    #[error("path not found")]
    PathNotFound,
    /// `targets` passed to [IngressHostCache::set] had a length outside `{1, 2}`.
    #[error("invalid target cardinality")]
    InvalidTarget,
}

/// A resolved backend: either a single resource name or a canary pair.
#[derive(Debug)]
pub enum Target {
    /// A single target resource name.
    Single(String),
    /// A canary pair `(primary, secondary)`.
    Pair(String, String),
}

impl Target {
    /// Build a [Target] from a non-empty name list of length 1 or 2.
    pub fn from_names(names: Vec<String>) -> Result<Self, CacheError> {
        match names.len() {
            1 => Ok(Target::Single(names.into_iter().next().unwrap())),
            2 => {
                let mut iter = names.into_iter();
                let first = iter.next().unwrap();
                let second = iter.next().unwrap();
                Ok(Target::Pair(first, second))
            }
            _ => Err(CacheError::InvalidTarget),
        }
    }

    /// The target resource names, in their original order.
    pub fn names(&self) -> Vec<String> {
        match self {
            Target::Single(name) => vec![name.clone()],
            Target::Pair(first, second) => vec![first.clone(), second.clone()],
        }
    }
}

impl PartialEq for Target {
    /// Set-equality: a [Target::Pair] matches regardless of element order (§8).
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Target::Single(a), Target::Single(b)) => a == b,
            (Target::Pair(a1, a2), Target::Pair(b1, b2)) => {
                (a1 == b1 && a2 == b2) || (a1 == b2 && a2 == b1)
            }
            _ => false,
        }
    }
}

/// One node of a per-host path trie, keyed by `/`-separated path segments.
#[derive(Default)]
struct TrieNode {
    value: Option<Target>,
    children: HashMap<String, TrieNode>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    fn set(&mut self, segments: &[String], target: Target) {
        match segments.split_first() {
            None => self.value = Some(target),
            Some((head, rest)) => self
                .children
                .entry(head.clone())
                .or_default()
                .set(rest, target),
        }
    }

    /// Remove `target` at `segments` if it matches what's stored there; prunes
    /// emptied child nodes on the way back up. Returns whether anything was removed.
    fn delete(&mut self, segments: &[String], target: &Target) -> bool {
        match segments.split_first() {
            None => {
                if self.value.as_ref() == Some(target) {
                    self.value = None;
                    true
                } else {
                    false
                }
            }
            Some((head, rest)) => {
                let Some(child) = self.children.get_mut(head) else {
                    return false;
                };
                let deleted = child.delete(rest, target);
                if deleted && child.is_empty() {
                    self.children.remove(head);
                }
                deleted
            }
        }
    }

    /// Longest-prefix walk: descend while segments match, remembering the
    /// deepest node that carries a value. No backtracking across `/`.
    fn longest_prefix(&self, segments: &[String]) -> Option<Target> {
        let mut node = self;
        let mut found = node.value.clone();
        for segment in segments {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.value.is_some() {
                        found = node.value.clone();
                    }
                }
                None => break,
            }
        }
        found
    }
}

impl Clone for Target {
    fn clone(&self) -> Self {
        match self {
            Target::Single(name) => Target::Single(name.clone()),
            Target::Pair(a, b) => Target::Pair(a.clone(), b.clone()),
        }
    }
}

/// Per-host path trie behind its own reader-writer lock.
struct SafeTrie {
    root: RwLock<TrieNode>,
}

impl SafeTrie {
    fn new() -> Self {
        Self {
            root: RwLock::new(TrieNode::default()),
        }
    }
}

/// Concurrent `host -> path-trie -> target` cache.
pub struct IngressHostCache {
    hosts: SkipMap<String, Arc<SafeTrie>>,
}

impl Default for IngressHostCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressHostCache {
    /// Return a new, empty cache.
    pub fn new() -> Self {
        Self {
            hosts: SkipMap::new(),
        }
    }

    fn segments(path: &str) -> Vec<String> {
        path.trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Replace any existing value at `(host, path)`. `targets` must have length 1 or 2.
    pub fn set(&self, host: &str, path: &str, targets: Vec<String>) -> Result<(), CacheError> {
        let target = Target::from_names(targets)?;
        let segments = Self::segments(path);
        let entry = self
            .hosts
            .get_or_insert_with(host.to_owned(), || Arc::new(SafeTrie::new()));
        entry
            .value()
            .root
            .write()
            .unwrap()
            .set(&segments, target);
        Ok(())
    }

    /// Remove the node at `(host, path)` only if its stored value set-equals `targets`.
    /// No-op on mismatch or missing host/path; removes the host entry if its trie empties.
    pub fn delete(&self, host: &str, path: &str, targets: Vec<String>) -> Result<(), CacheError> {
        let target = Target::from_names(targets)?;
        let segments = Self::segments(path);
        let Some(entry) = self.hosts.get(host) else {
            return Ok(());
        };
        let trie = entry.value().clone();
        let now_empty = {
            let mut root = trie.root.write().unwrap();
            root.delete(&segments, &target);
            root.is_empty()
        };
        if now_empty {
            self.hosts.remove(host);
        }
        Ok(())
    }

    /// Longest-prefix lookup of `path` under `host`, with a `"/"` fallback on miss.
    pub fn get(&self, host: &str, path: &str) -> Result<Target, CacheError> {
        let entry = self.hosts.get(host).ok_or(CacheError::HostNotFound)?;
        let trie = entry.value();
        let segments = Self::segments(path);
        {
            let root = trie.root.read().unwrap();
            if let Some(target) = root.longest_prefix(&segments) {
                return Ok(target);
            }
        }
        if path != "/" {
            let root = trie.root.read().unwrap();
            if let Some(target) = root.longest_prefix(&[]) {
                return Ok(target);
            }
        }
        Err(CacheError::PathNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn set_then_get_roundtrips() {
        let cache = IngressHostCache::new();
        cache
            .set("www.example.com", "/test/path", names(&["n1", "n2"]))
            .unwrap();
        let target = cache.get("www.example.com", "/test/path").unwrap();
        assert_eq!(target.names(), vec!["n1", "n2"]);
    }

    #[test]
    fn delete_empties_host_entry() {
        let cache = IngressHostCache::new();
        cache
            .set("www.example.com", "/test/path", names(&["n1", "n2"]))
            .unwrap();
        cache
            .delete("www.example.com", "/test/path", names(&["n1", "n2"]))
            .unwrap();
        let err = cache.get("www.example.com", "/test/path").unwrap_err();
        assert_eq!(err, CacheError::HostNotFound);
    }

    #[test]
    fn delete_is_order_insensitive_for_pairs() {
        let cache = IngressHostCache::new();
        cache.set("h", "/p", names(&["n1", "n2"])).unwrap();
        cache.delete("h", "/p", names(&["n2", "n1"])).unwrap();
        assert_eq!(cache.get("h", "/p").unwrap_err(), CacheError::HostNotFound);
    }

    #[test]
    fn delete_mismatch_is_a_no_op() {
        let cache = IngressHostCache::new();
        cache.set("h", "/p", names(&["n1"])).unwrap();
        cache.delete("h", "/p", names(&["other"])).unwrap();
        assert_eq!(cache.get("h", "/p").unwrap().names(), vec!["n1"]);
    }

    #[test]
    fn longest_prefix_with_root_fallback() {
        let cache = IngressHostCache::new();
        cache.set("h", "/api", names(&["a"])).unwrap();
        cache.set("h", "/", names(&["root"])).unwrap();
        assert_eq!(cache.get("h", "/api/x").unwrap().names(), vec!["a"]);
        assert_eq!(cache.get("h", "/other").unwrap().names(), vec!["root"]);
    }

    #[test]
    fn invalid_cardinality_is_rejected() {
        let cache = IngressHostCache::new();
        let err = cache.set("h", "/p", names(&["a", "b", "c"])).unwrap_err();
        assert_eq!(err, CacheError::InvalidTarget);
        let err = cache.set("h", "/p", Vec::new()).unwrap_err();
        assert_eq!(err, CacheError::InvalidTarget);
    }

    #[test]
    fn idempotent_set() {
        let cache = IngressHostCache::new();
        cache.set("h", "/p", names(&["a"])).unwrap();
        cache.set("h", "/p", names(&["a"])).unwrap();
        assert_eq!(cache.get("h", "/p").unwrap().names(), vec!["a"]);
    }

    #[test]
    fn missing_host_is_host_not_found() {
        let cache = IngressHostCache::new();
        assert_eq!(
            cache.get("nope", "/p").unwrap_err(),
            CacheError::HostNotFound
        );
    }

    #[test]
    fn missing_path_under_known_host_is_path_not_found() {
        let cache = IngressHostCache::new();
        cache.set("h", "/only", names(&["a"])).unwrap();
        assert_eq!(
            cache.get("h", "/elsewhere").unwrap_err(),
            CacheError::PathNotFound
        );
    }
}

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

//! Mirrors Kubernetes `Ingress` resources into an [IngressHostCache].

use crossbeam_skiplist::SkipMap;
use futures::TryStreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ingress_cache::IngressHostCache;

/// Errors raised while extracting or applying an ingress update.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The ingress has no rules at all.
    #[error("ingress has no rules")]
    NoRules,
    /// The first rule has an empty or missing host.
    #[error("ingress rule has no host")]
    MissingHost,
    /// The first rule's first HTTP path is empty or missing.
    #[error("ingress rule has no path")]
    MissingPath,
    /// The injected `ResolveTargets` callback returned no targets.
    #[error("no targets resolved for ingress")]
    NoTargets,
    /// The underlying cache rejected the mutation (invalid target cardinality).
    #[error(transparent)]
    Cache(#[from] crate::ingress_cache::CacheError),
    /// Initial synchronization did not complete within the configured timeout.
    #[error("initial sync did not complete in time")]
    SyncFailed,
    /// The watch stream itself failed.
    #[error("watch stream error: {0}")]
    Stream(String),
}

/// One observed `(host, path) -> targets` mapping, keyed by source ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IngressEntry {
    host: String,
    path: String,
    targets: Vec<String>,
}

/// `ResolveTargets` callback: given an `Ingress`, return the backend resource names.
pub type ResolveTargets = dyn Fn(&Ingress) -> Vec<String> + Send + Sync;

/// Mirrors ingress add/update/delete events into an [IngressHostCache].
pub struct IngressWatcher {
    cache: Arc<IngressHostCache>,
    resolve_targets: Box<ResolveTargets>,
    /// Last applied entry per `namespace/name`, so updates know what to retract.
    applied: SkipMap<String, IngressEntry>,
    initial_sync_timeout: Duration,
}

impl IngressWatcher {
    /// Build a new watcher over `cache`, resolving backend names with `resolve_targets`.
    pub fn new(
        cache: Arc<IngressHostCache>,
        resolve_targets: impl Fn(&Ingress) -> Vec<String> + Send + Sync + 'static,
        initial_sync_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            resolve_targets: Box::new(resolve_targets),
            applied: SkipMap::new(),
            initial_sync_timeout,
        })
    }

    fn ingress_key(ingress: &Ingress) -> String {
        let namespace = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        namespace + "/" + &name
    }

    fn extract(&self, ingress: &Ingress) -> Result<IngressEntry, WatchError> {
        let rules = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.as_ref())
            .filter(|rules| !rules.is_empty())
            .ok_or(WatchError::NoRules)?;
        if rules.len() > 1 {
            log::info!(
                "ingress '{}' declares {} rules; only the first is used",
                Self::ingress_key(ingress),
                rules.len()
            );
        }
        let rule = &rules[0];
        let host = rule
            .host
            .clone()
            .filter(|host| !host.is_empty())
            .ok_or(WatchError::MissingHost)?;
        let path = rule
            .http
            .as_ref()
            .and_then(|http| http.paths.first())
            .and_then(|path| path.path.clone())
            .filter(|path| !path.is_empty())
            .ok_or(WatchError::MissingPath)?;
        let targets = (self.resolve_targets)(ingress);
        if targets.is_empty() {
            return Err(WatchError::NoTargets);
        }
        Ok(IngressEntry {
            host,
            path,
            targets,
        })
    }

    /// Apply an added or updated ingress: retract the old `(host, path)` if it
    /// moved, then write the new one. The cache is never partially updated —
    /// extraction failures skip the mutation entirely.
    fn apply(&self, ingress: &Ingress) {
        let key = Self::ingress_key(ingress);
        let new_entry = match self.extract(ingress) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping ingress '{key}': {e}");
                return;
            }
        };
        let old_entry = self.applied.get(&key).map(|e| e.value().clone());
        if let Some(old) = &old_entry {
            if old.host != new_entry.host || old.path != new_entry.path {
                if let Err(e) = self.cache.delete(&old.host, &old.path, old.targets.clone()) {
                    log::warn!("failed to retract stale ingress path for '{key}': {e}");
                }
            }
        }
        if let Err(e) = self
            .cache
            .set(&new_entry.host, &new_entry.path, new_entry.targets.clone())
        {
            log::warn!("failed to apply ingress '{key}': {e}");
            return;
        }
        self.applied.insert(key, new_entry);
    }

    /// Handler invoked when an ingress is added.
    pub fn handle_add(&self, ingress: &Ingress) {
        self.apply(ingress);
    }

    /// Handler invoked when an ingress is updated.
    pub fn handle_update(&self, ingress: &Ingress) {
        self.apply(ingress);
    }

    /// Handler invoked when an ingress is deleted.
    pub fn handle_delete(&self, ingress: &Ingress) {
        let key = Self::ingress_key(ingress);
        if let Some(entry) = self.applied.remove(&key) {
            let entry = entry.value();
            if let Err(e) = self.cache.delete(&entry.host, &entry.path, entry.targets.clone()) {
                log::warn!("failed to remove ingress '{key}' from cache: {e}");
            }
        }
    }

    /// Start watching `namespace` (or all namespaces) for ingress changes.
    ///
    /// Waits for the initial listing to complete before returning; failure or
    /// timeout is fatal per `spec.md` §4.2. Runs the watch loop as a detached
    /// task until `cancellation` fires.
    pub async fn start(
        self: &Arc<Self>,
        client: kube::Client,
        namespace: Option<String>,
        cancellation: CancellationToken,
    ) -> Result<(), WatchError> {
        let api: Api<Ingress> = match &namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let lp = ListParams::default();
        let initial = tokio::time::timeout(self.initial_sync_timeout, api.list(&lp))
            .await
            .map_err(|_| WatchError::SyncFailed)?
            .map_err(|e| WatchError::Stream(e.to_string()))?;
        for ingress in &initial {
            self.handle_add(ingress);
        }
        let self_clone = Arc::clone(self);
        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default());
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        log::debug!("ingress watcher stopping on cancellation");
                        break;
                    }
                    next = stream.try_next() => {
                        match next {
                            Ok(Some(watcher::Event::Applied(ingress))) => {
                                self_clone.handle_update(&ingress);
                            }
                            Ok(Some(watcher::Event::Deleted(ingress))) => {
                                self_clone.handle_delete(&ingress);
                            }
                            Ok(Some(watcher::Event::Restarted(_))) => {
                                log::debug!("ingress watch restarted");
                            }
                            Ok(None) => break,
                            Err(e) => {
                                log::warn!("ingress watch stream error: {e:?}");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressRule, IngressSpec,
    };
    use kube::api::ObjectMeta;

    fn ingress_with(
        name: &str,
        host: &str,
        path: &str,
        extra_rules: usize,
    ) -> Ingress {
        let mut rules = vec![IngressRule {
            host: Some(host.to_owned()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(path.to_owned()),
                    path_type: "Prefix".to_owned(),
                    backend: Default::default(),
                }],
            }),
        }];
        for _ in 0..extra_rules {
            rules.push(rules[0].clone());
        }
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(rules),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn add_then_delete_clears_cache() {
        let cache = Arc::new(IngressHostCache::new());
        let watcher = IngressWatcher::new(
            Arc::clone(&cache),
            |_ingress| vec!["svc-a".to_owned()],
            Duration::from_secs(5),
        );
        let ingress = ingress_with("app", "www.example.com", "/app", 0);
        watcher.handle_add(&ingress);
        assert_eq!(
            cache.get("www.example.com", "/app").unwrap().names(),
            vec!["svc-a"]
        );
        watcher.handle_delete(&ingress);
        assert!(cache.get("www.example.com", "/app").is_err());
    }

    #[test]
    fn update_moving_host_retracts_old_entry() {
        let cache = Arc::new(IngressHostCache::new());
        let watcher = IngressWatcher::new(
            Arc::clone(&cache),
            |_ingress| vec!["svc-a".to_owned()],
            Duration::from_secs(5),
        );
        let v1 = ingress_with("app", "old.example.com", "/app", 0);
        watcher.handle_add(&v1);
        let v2 = ingress_with("app", "new.example.com", "/app", 0);
        watcher.handle_update(&v2);
        assert!(cache.get("old.example.com", "/app").is_err());
        assert_eq!(
            cache.get("new.example.com", "/app").unwrap().names(),
            vec!["svc-a"]
        );
    }

    #[test]
    fn extra_rules_are_ignored_not_fatal() {
        let cache = Arc::new(IngressHostCache::new());
        let watcher = IngressWatcher::new(
            Arc::clone(&cache),
            |_ingress| vec!["svc-a".to_owned()],
            Duration::from_secs(5),
        );
        let ingress = ingress_with("app", "www.example.com", "/app", 2);
        watcher.handle_add(&ingress);
        assert_eq!(
            cache.get("www.example.com", "/app").unwrap().names(),
            vec!["svc-a"]
        );
    }

    #[test]
    fn no_targets_resolved_skips_mutation() {
        let cache = Arc::new(IngressHostCache::new());
        let watcher = IngressWatcher::new(
            Arc::clone(&cache),
            |_ingress| Vec::new(),
            Duration::from_secs(5),
        );
        let ingress = ingress_with("app", "www.example.com", "/app", 0);
        watcher.handle_add(&ingress);
        assert!(cache.get("www.example.com", "/app").is_err());
    }
}

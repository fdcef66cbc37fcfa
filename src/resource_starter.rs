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

//! Coalesces concurrent activation requests for the same target into a single scale-up.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::resource::Resource;
use crate::resource_scaler::ResourceScaler;

/// How long a sink keeps fanning out results to late subscribers after activation completes.
const FAN_OUT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of an activation, delivered to every waiter for a target.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusResult {
    /// The target resource key this result applies to.
    pub target: String,
    /// HTTP status the caller should respond with.
    pub http_status: u16,
    /// Error detail, if any.
    pub error: Option<String>,
}

impl StatusResult {
    fn ok(target: &str) -> Self {
        Self {
            target: target.to_owned(),
            http_status: 200,
            error: None,
        }
    }

    fn timeout(target: &str) -> Self {
        Self {
            target: target.to_owned(),
            http_status: 504,
            error: Some("timed out waiting for resource readiness".to_owned()),
        }
    }

    fn scale_error(target: &str, error: String) -> Self {
        Self {
            target: target.to_owned(),
            http_status: 500,
            error: Some(error),
        }
    }
}

type Inbox = mpsc::UnboundedSender<oneshot::Sender<StatusResult>>;
type InboxReceiver = mpsc::UnboundedReceiver<oneshot::Sender<StatusResult>>;

/// Ensures at most one `SetScale(target, 1)` is in flight per target, fanning
/// the outcome out to every concurrent caller (`spec.md` §4.5).
pub struct ResourceStarter {
    scaler: Arc<dyn ResourceScaler>,
    readiness_timeout: Duration,
    sinks: SkipMap<String, Inbox>,
}

impl ResourceStarter {
    /// Build a new starter against `scaler`, bounding activation by `readiness_timeout`.
    pub fn new(scaler: Arc<dyn ResourceScaler>, readiness_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            scaler,
            readiness_timeout,
            sinks: SkipMap::new(),
        })
    }

    /// Request activation of `resource`. The result is delivered on `reply_tx`
    /// exactly once, alongside every other concurrent caller for the same target.
    pub fn handle_resource_start(
        self: &Arc<Self>,
        resource: Resource,
        mut reply_tx: oneshot::Sender<StatusResult>,
    ) {
        let target = resource.key();
        loop {
            let mut created_rx: Option<InboxReceiver> = None;
            let inbox_tx = {
                let created_rx_slot = &mut created_rx;
                self.sinks
                    .get_or_insert_with(target.clone(), move || {
                        let (tx, rx) = mpsc::unbounded_channel();
                        *created_rx_slot = Some(rx);
                        tx
                    })
                    .value()
                    .clone()
            };
            match inbox_tx.send(reply_tx) {
                Ok(()) => {
                    if let Some(rx) = created_rx {
                        self.spawn_activator(target, resource, rx);
                    }
                    return;
                }
                Err(mpsc::error::SendError(returned_reply_tx)) => {
                    // The sink was torn down between lookup and send (the fan-out
                    // idle timeout raced us). Retry: a fresh activator is spawned.
                    reply_tx = returned_reply_tx;
                }
            }
        }
    }

    fn spawn_activator(self: &Arc<Self>, target: String, resource: Resource, inbox_rx: InboxReceiver) {
        let self_clone = Arc::clone(self);
        tokio::spawn(async move {
            let status = self_clone.activate(&target, &resource).await;
            self_clone.fan_out(&target, status, inbox_rx).await;
            self_clone.sinks.remove(&target);
        });
    }

    /// Drive `SetScale([resource], 1)` to completion or timeout, under a cancellable subtask.
    async fn activate(&self, target: &str, resource: &Resource) -> StatusResult {
        let cancellation = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let scaler = Arc::clone(&self.scaler);
        let resource_clone = resource.clone();
        let subtask_cancellation = cancellation.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = subtask_cancellation.cancelled() => {
                    log::debug!("scale-up subtask cancelled after readiness timeout");
                }
                result = scaler.set_scale(std::slice::from_ref(&resource_clone), 1) => {
                    let _ = ready_tx.send(result);
                }
            }
        });
        tokio::select! {
            result = ready_rx => match result {
                Ok(Ok(())) => StatusResult::ok(target),
                Ok(Err(e)) => StatusResult::scale_error(target, e.to_string()),
                Err(_) => StatusResult::scale_error(target, "scale-up subtask dropped".to_owned()),
            },
            _ = tokio::time::sleep(self.readiness_timeout) => {
                cancellation.cancel();
                StatusResult::timeout(target)
            }
        }
    }

    /// Deliver `status` to every reply-chan arriving on `inbox_rx` until one
    /// minute of inactivity passes, then return so the caller removes the sink.
    async fn fan_out(&self, target: &str, status: StatusResult, mut inbox_rx: InboxReceiver) {
        loop {
            tokio::select! {
                maybe_reply = inbox_rx.recv() => {
                    match maybe_reply {
                        Some(reply_tx) => {
                            let _ = reply_tx.send(status.clone());
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(FAN_OUT_IDLE_TIMEOUT) => {
                    log::trace!("activation sink for '{target}' idle; removing");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_scaler::ScalerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn resource(name: &str) -> Resource {
        Resource {
            name: name.to_owned(),
            namespace: "default".to_owned(),
            scale_specs: Vec::new(),
            last_scale_event: None,
        }
    }

    struct CountingScaler {
        calls: AtomicUsize,
        delay: StdDuration,
    }

    #[async_trait]
    impl ResourceScaler for CountingScaler {
        async fn get_resources(&self) -> Result<Vec<Resource>, ScalerError> {
            Ok(Vec::new())
        }
        async fn set_scale(&self, _resources: &[Resource], _replicas: u32) -> Result<(), ScalerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
        async fn resolve_service_name(&self, _resource: &Resource) -> Result<String, ScalerError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn single_activation_per_same_target() {
        let scaler = Arc::new(CountingScaler {
            calls: AtomicUsize::new(0),
            delay: StdDuration::from_millis(5),
        });
        let starter = ResourceStarter::new(scaler.clone(), StdDuration::from_secs(1));
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = oneshot::channel();
            starter.handle_resource_start(resource("t"), tx);
            receivers.push(rx);
        }
        for rx in receivers {
            let status = rx.await.unwrap();
            assert_eq!(status.http_status, 200);
        }
        assert_eq!(scaler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn coalesced_activation_across_distinct_targets() {
        let scaler = Arc::new(CountingScaler {
            calls: AtomicUsize::new(0),
            delay: StdDuration::from_millis(1),
        });
        let starter = ResourceStarter::new(scaler.clone(), StdDuration::from_secs(1));
        let mut receivers = Vec::new();
        for i in 0..200 {
            let (tx, rx) = oneshot::channel();
            starter.handle_resource_start(resource(&format!("t{i}")), tx);
            receivers.push((i, rx));
        }
        for (i, rx) in receivers {
            let status = rx.await.unwrap();
            assert_eq!(status.http_status, 200);
            assert_eq!(status.target, format!("default/t{i}"));
        }
        assert_eq!(scaler.calls.load(Ordering::SeqCst), 200);
    }

    #[tokio::test]
    async fn readiness_timeout_yields_504() {
        let scaler = Arc::new(CountingScaler {
            calls: AtomicUsize::new(0),
            delay: StdDuration::from_secs(10),
        });
        let starter = ResourceStarter::new(scaler, StdDuration::from_millis(5));
        let (tx, rx) = oneshot::channel();
        starter.handle_resource_start(resource("slow"), tx);
        let status = rx.await.unwrap();
        assert_eq!(status.http_status, 504);
    }
}

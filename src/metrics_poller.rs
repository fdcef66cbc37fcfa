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

//! Converts a pull-based metrics endpoint into a push stream for [crate::autoscaler::Autoscaler].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::autoscaler::Autoscaler;
use crate::metrics_source::{MetricsSource, PollError};

/// Periodically polls a [MetricsSource] and forwards every measurement to an [Autoscaler].
pub struct MetricsPoller {
    source: Arc<dyn MetricsSource>,
    autoscaler: Arc<Autoscaler>,
    group_kind: String,
    metric_name: String,
    namespace: Option<String>,
    poll_interval: Duration,
    /// Set once the first poll attempt (successful or not) has completed.
    polled_once: AtomicBool,
}

impl MetricsPoller {
    /// Build a new poller. Nothing runs until [Self::start] is called.
    pub fn new(
        source: Arc<dyn MetricsSource>,
        autoscaler: Arc<Autoscaler>,
        group_kind: String,
        metric_name: String,
        namespace: Option<String>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            autoscaler,
            group_kind,
            metric_name,
            namespace,
            poll_interval,
            polled_once: AtomicBool::new(false),
        })
    }

    /// Whether at least one poll attempt has completed, used for readiness reporting.
    pub fn has_polled(&self) -> bool {
        self.polled_once.load(Ordering::Relaxed)
    }

    /// Spawn the periodic polling task.
    pub fn start(self: &Arc<Self>) {
        let self_clone = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self_clone.poll_interval);
            loop {
                ticker.tick().await;
                self_clone.poll_once().await;
            }
        });
    }

    async fn poll_once(&self) {
        let result = self
            .source
            .poll(
                &self.group_kind,
                &self.metric_name,
                self.namespace.as_deref(),
            )
            .await;
        self.polled_once.store(true, Ordering::Relaxed);
        match result {
            Ok(entries) => {
                for entry in entries {
                    self.autoscaler.report_metric(entry);
                }
            }
            Err(PollError::NotFound) => {
                log::debug!(
                    "no '{}' objects carrying metric '{}' found; treating as idle",
                    self.group_kind,
                    self.metric_name
                );
            }
            Err(PollError::TransportError(e)) => {
                log::warn!("metrics poll failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{MetricEntry, Resource};
    use crate::resource_scaler::{ResourceScaler, ScalerError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::{Duration as StdDuration, SystemTime};

    struct FakeSource {
        responses: Mutex<Vec<Result<Vec<MetricEntry>, PollError>>>,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        async fn poll(
            &self,
            _group_kind: &str,
            _metric_name: &str,
            _namespace: Option<&str>,
        ) -> Result<Vec<MetricEntry>, PollError> {
            self.responses.lock().unwrap().pop().unwrap_or(Ok(Vec::new()))
        }
    }

    struct NoopScaler;

    #[async_trait]
    impl ResourceScaler for NoopScaler {
        async fn get_resources(&self) -> Result<Vec<Resource>, ScalerError> {
            Ok(Vec::new())
        }
        async fn set_scale(&self, _resources: &[Resource], _replicas: u32) -> Result<(), ScalerError> {
            Ok(())
        }
        async fn resolve_service_name(&self, _resource: &Resource) -> Result<String, ScalerError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn not_found_is_not_fatal_and_marks_polled() {
        let source = Arc::new(FakeSource {
            responses: Mutex::new(vec![Err(PollError::NotFound)]),
        });
        let autoscaler = Autoscaler::new(Arc::new(NoopScaler), StdDuration::from_secs(30));
        let poller = MetricsPoller::new(
            source,
            autoscaler,
            "external.metrics.k8s.io/v1beta1".to_owned(),
            "requests".to_owned(),
            None,
            Duration::from_millis(10),
        );
        poller.poll_once().await;
        assert!(poller.has_polled());
    }

    #[tokio::test]
    async fn entries_are_forwarded_to_autoscaler() {
        let entry = MetricEntry {
            timestamp: SystemTime::now(),
            value_milli_units: 0,
            resource_name: "f".to_owned(),
            metric_name: "requests".to_owned(),
        };
        let source = Arc::new(FakeSource {
            responses: Mutex::new(vec![Ok(vec![entry])]),
        });
        let autoscaler = Autoscaler::new(Arc::new(NoopScaler), StdDuration::from_secs(30));
        let mut rx = autoscaler.take_receiver_for_test();
        let poller = MetricsPoller::new(
            source,
            Arc::clone(&autoscaler),
            "external.metrics.k8s.io/v1beta1".to_owned(),
            "requests".to_owned(),
            None,
            Duration::from_millis(10),
        );
        poller.poll_once().await;
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.resource_name, "f");
        assert_eq!(forwarded.metric_name, "requests");
    }
}

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

//! Maintains per-resource sliding metric windows and decides when to scale to zero.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use crate::resource::{MetricEntry, Resource};
use crate::resource_scaler::ResourceScaler;

/// Bound on the metric channel; full channel means dropped entries (§5).
const METRIC_CHANNEL_CAPACITY: usize = 1024;

/// Maintains one sliding window per `(resource, metric)` pair and issues scale-to-zero.
pub struct Autoscaler {
    scaler: Arc<dyn ResourceScaler>,
    scale_interval: Duration,
    metric_tx: mpsc::Sender<MetricEntry>,
    metric_rx: Mutex<Option<mpsc::Receiver<MetricEntry>>>,
    started: AtomicBool,
}

impl Autoscaler {
    /// Build a new, unstarted autoscaler against `scaler`, evaluating every `scale_interval`.
    pub fn new(scaler: Arc<dyn ResourceScaler>, scale_interval: Duration) -> Arc<Self> {
        let (metric_tx, metric_rx) = mpsc::channel(METRIC_CHANNEL_CAPACITY);
        Arc::new(Self {
            scaler,
            scale_interval,
            metric_tx,
            metric_rx: Mutex::new(Some(metric_rx)),
            started: AtomicBool::new(false),
        })
    }

    /// Non-blocking submission of a measurement. Dropped and logged if the channel is full.
    pub fn report_metric(&self, entry: MetricEntry) {
        if self.metric_tx.try_send(entry).is_err() {
            log::warn!("metric channel full; dropping entry (liveness over completeness)");
        }
    }

    /// Whether the evaluator loop has been started, used for readiness reporting.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Launch the single evaluator loop. Panics if called more than once.
    pub fn start(self: &Arc<Self>) {
        let mut rx_guard = self.metric_rx.lock().unwrap();
        let mut metric_rx = rx_guard.take().expect("Autoscaler::start() called twice");
        drop(rx_guard);
        self.started.store(true, Ordering::Relaxed);
        let self_clone = Arc::clone(self);
        tokio::spawn(async move {
            let mut windows: HashMap<(String, String), VecDeque<MetricEntry>> = HashMap::new();
            let mut ticker = tokio::time::interval(self_clone.scale_interval);
            loop {
                tokio::select! {
                    maybe_entry = metric_rx.recv() => {
                        match maybe_entry {
                            Some(entry) => {
                                windows
                                    .entry((entry.resource_name.clone(), entry.metric_name.clone()))
                                    .or_default()
                                    .push_back(entry);
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        self_clone.evaluate(&mut windows, SystemTime::now()).await;
                    }
                }
            }
        });
    }

    /// Evaluate every active resource's scale specs against its window at time `now`.
    async fn evaluate(
        &self,
        windows: &mut HashMap<(String, String), VecDeque<MetricEntry>>,
        now: SystemTime,
    ) {
        let resources = match self.scaler.get_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                log::warn!("failed to enumerate active resources; skipping this tick: {e}");
                Vec::new()
            }
        };
        for resource in &resources {
            for spec in &resource.scale_specs {
                let key = (resource.name.clone(), spec.metric_name.clone());
                let Some(window) = windows.get_mut(&key) else {
                    continue;
                };
                if Self::evaluate_window(window, now, spec.window, spec.threshold) {
                    if let Err(e) = self.scaler.set_scale(std::slice::from_ref(resource), 0).await
                    {
                        log::warn!("failed to scale '{}' to zero: {e}", resource.key());
                    } else {
                        log::info!("scaled '{}' to zero after quiet window", resource.key());
                    }
                    windows.remove(&key);
                }
            }
        }
    }

    /// Pure evaluation rule for a single `(resource, metric)` window (`spec.md` §4.4).
    ///
    /// Returns `true` if the resource should be scaled to zero. The candidate
    /// walk and the window-eviction walk are deliberately independent passes —
    /// the eviction below always runs and keeps recent entries regardless of
    /// value, even when a scale decision was also made this tick.
    fn evaluate_window(
        window: &mut VecDeque<MetricEntry>,
        now: SystemTime,
        window_size: Duration,
        threshold: i64,
    ) -> bool {
        let candidate = Self::find_candidate(window, threshold);
        let should_scale = candidate
            .map(|candidate_ts| {
                now.duration_since(candidate_ts)
                    .map(|age| age > window_size)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        window.retain(|entry| {
            now.duration_since(entry.timestamp)
                .map(|age| age <= window_size)
                .unwrap_or(true)
        });
        should_scale
    }

    /// Walk `window` in order, tracking the earliest entry after which every
    /// later entry stays at-or-below `threshold`. A value above `threshold`
    /// resets the candidate.
    fn find_candidate(window: &VecDeque<MetricEntry>, threshold: i64) -> Option<SystemTime> {
        let mut candidate = None;
        for entry in window {
            if entry.value_milli_units > threshold {
                candidate = None;
            } else if candidate.is_none() {
                candidate = Some(entry.timestamp);
            }
        }
        candidate
    }

    #[cfg(test)]
    pub(crate) fn take_receiver_for_test(&self) -> mpsc::Receiver<MetricEntry> {
        self.metric_rx.lock().unwrap().take().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_scaler::ScalerError;
    use async_trait::async_trait;

    fn entry_ago(now: SystemTime, ago: Duration, value: i64) -> MetricEntry {
        MetricEntry {
            timestamp: now - ago,
            value_milli_units: value,
            resource_name: "f".to_owned(),
            metric_name: "requests".to_owned(),
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

    #[test]
    fn scale_to_zero_after_quiet_window() {
        let now = SystemTime::now();
        let mut window = VecDeque::new();
        window.push_back(entry_ago(now, Duration::from_secs(120), 0));
        let should_scale =
            Autoscaler::evaluate_window(&mut window, now, Duration::from_secs(60), 0);
        assert!(should_scale);
    }

    #[test]
    fn no_scale_during_partial_quiet_first_round() {
        let now = SystemTime::now();
        let mut window = VecDeque::new();
        for ago_secs in [240, 200, 180, 120, 100] {
            window.push_back(entry_ago(now, Duration::from_secs(ago_secs), 0));
        }
        let should_scale =
            Autoscaler::evaluate_window(&mut window, now, Duration::from_secs(300), 0);
        assert!(!should_scale);
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn no_scale_during_partial_quiet_second_round_with_spike() {
        let now = SystemTime::now();
        let mut window = VecDeque::new();
        for ago_secs in [240, 200, 180, 120, 100] {
            window.push_back(entry_ago(now, Duration::from_secs(ago_secs), 0));
        }
        Autoscaler::evaluate_window(&mut window, now, Duration::from_secs(300), 0);
        let now2 = now + Duration::from_secs(95);
        for ago_secs in [50, 40, 30, 20, 10] {
            window.push_back(entry_ago(now2, Duration::from_secs(ago_secs), 0));
        }
        window.push_back(entry_ago(now2, Duration::from_secs(5), 9));
        let should_scale =
            Autoscaler::evaluate_window(&mut window, now2, Duration::from_secs(300), 0);
        assert!(!should_scale);
    }

    #[test]
    fn spike_resets_candidate() {
        let now = SystemTime::now();
        let mut window = VecDeque::new();
        window.push_back(entry_ago(now, Duration::from_secs(120), 0));
        window.push_back(entry_ago(now, Duration::from_secs(90), 5));
        window.push_back(entry_ago(now, Duration::from_secs(80), 0));
        // Candidate resets at the spike, so only the last entry (80s ago) is
        // the candidate; 80s does not exceed a 60s window... use 70s window.
        let should_scale =
            Autoscaler::evaluate_window(&mut window, now, Duration::from_secs(70), 0);
        assert!(should_scale);
    }

    #[tokio::test]
    async fn report_metric_is_observed_by_the_channel() {
        let autoscaler = Autoscaler::new(Arc::new(NoopScaler), Duration::from_secs(30));
        let mut rx = autoscaler.take_receiver_for_test();
        autoscaler.report_metric(MetricEntry {
            timestamp: SystemTime::now(),
            value_milli_units: 0,
            resource_name: "f".to_owned(),
            metric_name: "requests".to_owned(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.resource_name, "f");
    }

    #[test]
    fn full_channel_drops_entries_without_panicking() {
        let autoscaler = Autoscaler::new(Arc::new(NoopScaler), Duration::from_secs(30));
        for _ in 0..(METRIC_CHANNEL_CAPACITY + 10) {
            autoscaler.report_metric(MetricEntry {
                timestamp: SystemTime::now(),
                value_milli_units: 0,
                resource_name: "f".to_owned(),
                metric_name: "requests".to_owned(),
            });
        }
    }
}

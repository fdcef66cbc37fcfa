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

//! Abstraction over the custom/external metrics endpoint [crate::metrics_poller::MetricsPoller] pulls from.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::resource::MetricEntry;

/// Errors a [MetricsSource] may surface. `NotFound` is explicitly not fatal (§7).
#[derive(Debug, Error)]
pub enum PollError {
    /// The metrics endpoint reports no objects of the requested kind; not an error (§4.3).
    #[error("no such resources")]
    NotFound,
    /// Transport or deserialization failure; logged, next tick proceeds.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Source of per-object custom metric measurements.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch one measurement per object of `group_kind` carrying `metric_name`, in `namespace`.
    async fn poll(
        &self,
        group_kind: &str,
        metric_name: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<MetricEntry>, PollError>;
}

/// JSON shape returned by the Kubernetes custom/external metrics aggregated API.
#[derive(Debug, Deserialize)]
struct MetricValueList {
    items: Vec<MetricValue>,
}

#[derive(Debug, Deserialize)]
struct MetricValue {
    #[serde(rename = "describedObject")]
    described_object: DescribedObject,
    #[serde(rename = "metricName")]
    metric_name: String,
    value: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DescribedObject {
    name: String,
}

/// [MetricsSource] backed by the Kubernetes aggregated custom-metrics API.
pub struct CustomMetricsSource {
    client: kube::Client,
}

impl CustomMetricsSource {
    /// Wrap an existing [kube::Client].
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn request_path(group_kind: &str, namespace: Option<&str>, metric_name: &str) -> String {
        match namespace {
            Some(namespace) => format!(
                "/apis/{group_kind}/namespaces/{namespace}/*/{metric_name}"
            ),
            None => format!("/apis/{group_kind}/*/{metric_name}"),
        }
    }
}

#[async_trait]
impl MetricsSource for CustomMetricsSource {
    async fn poll(
        &self,
        group_kind: &str,
        metric_name: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<MetricEntry>, PollError> {
        let path = Self::request_path(group_kind, namespace, metric_name);
        let request = http::Request::builder()
            .uri(path)
            .body(Vec::new())
            .map_err(|e| PollError::TransportError(e.to_string()))?;
        let response: MetricValueList = self.client.request(request).await.map_err(|e| {
            if matches!(&e, kube::Error::Api(api_err) if api_err.code == 404) {
                PollError::NotFound
            } else {
                PollError::TransportError(e.to_string())
            }
        })?;
        let now = SystemTime::now();
        let entries = response
            .items
            .into_iter()
            .filter_map(|item| {
                let value_milli_units = parse_milli_units(&item.value).ok()?;
                let timestamp = item
                    .timestamp
                    .as_deref()
                    .and_then(parse_rfc3339)
                    .unwrap_or(now);
                Some(MetricEntry {
                    timestamp,
                    value_milli_units,
                    resource_name: item.described_object.name,
                    metric_name: item.metric_name,
                })
            })
            .collect();
        Ok(entries)
    }
}

/// Parse the Kubernetes quantity-style metric value (e.g. `"150m"` or `"3"`) into milli-units.
fn parse_milli_units(value: &str) -> Result<i64, std::num::ParseIntError> {
    if let Some(milli) = value.strip_suffix('m') {
        milli.parse()
    } else {
        value.parse::<i64>().map(|whole| whole * 1_000)
    }
}

/// Best-effort RFC3339 timestamp parse; falls back to "now" on failure (kept intentionally lossy).
fn parse_rfc3339(value: &str) -> Option<SystemTime> {
    // Avoid pulling in a chrono dependency for a single best-effort field: only
    // the common `YYYY-MM-DDTHH:MM:SSZ` shape (no fractional seconds/offsets)
    // is handled; anything else falls back to "now" in the caller.
    let value = value.strip_suffix('Z')?;
    let (date, time) = value.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next()?.parse().ok()?;
    let days_since_epoch = days_from_civil(year, month, day);
    let secs = days_since_epoch * 86_400 + hour * 3_600 + minute * 60 + second;
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

/// Howard Hinnant's days-from-civil algorithm (proleptic Gregorian, days since 1970-01-01).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_milli_suffixed_values() {
        assert_eq!(parse_milli_units("150m").unwrap(), 150);
        assert_eq!(parse_milli_units("3").unwrap(), 3_000);
    }

    #[test]
    fn parses_known_epoch_date() {
        let ts = parse_rfc3339("1970-01-01T00:00:00Z").unwrap();
        assert_eq!(ts, UNIX_EPOCH);
        let ts = parse_rfc3339("1970-01-02T00:00:01Z").unwrap();
        assert_eq!(ts, UNIX_EPOCH + Duration::from_secs(86_401));
    }
}

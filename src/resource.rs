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

//! Core data model: [Resource], [ScaleSpec] and [MetricEntry].
//!
//! The core treats a [Resource] as opaque beyond its name, namespace and
//! scale specs; the [crate::resource_scaler::ResourceScaler] is authoritative
//! for actual replica state.

use std::time::SystemTime;

/// One `(metric-name, window, threshold)` scaling rule attached to a [Resource].
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleSpec {
    /// Name of the custom metric this rule evaluates.
    pub metric_name: String,
    /// Sliding window duration over which the metric must stay at-or-below `threshold`.
    pub window: std::time::Duration,
    /// Threshold in milli-units, inclusive, below which the metric is considered "inactive".
    pub threshold: i64,
}

/// Observability-only record of the most recent scale action taken on a [Resource].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleEvent {
    /// Replica count requested.
    pub replicas: u32,
    /// When the request was made.
    pub at: SystemTime,
}

/// A named addressable workload managed by the [crate::resource_scaler::ResourceScaler].
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Unique name within `namespace`.
    pub name: String,
    /// Kubernetes (or equivalent) namespace.
    pub namespace: String,
    /// Scaling rules attached to this resource.
    pub scale_specs: Vec<ScaleSpec>,
    /// Most recent scale action, if any.
    pub last_scale_event: Option<ScaleEvent>,
}

impl Resource {
    /// Identifier unique across a single [crate::resource_scaler::ResourceScaler] instance.
    pub fn key(&self) -> String {
        self.namespace.clone() + "/" + &self.name
    }
}

/// A single measurement pulled from the metrics source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEntry {
    /// When the measurement was taken (as reported by the metrics source, or poll time).
    pub timestamp: SystemTime,
    /// Measured value, in integer milli-units.
    pub value_milli_units: i64,
    /// Name of the [Resource] this measurement applies to.
    pub resource_name: String,
    /// Name of the metric this measurement applies to.
    pub metric_name: String,
}

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

//! CLI configuration for the `autoscaler` binary.

use clap::Parser;
use std::time::Duration;

/// Metrics-driven scale-to-zero evaluator.
#[derive(Debug, Clone, Parser)]
#[command(name = "autoscaler", version, about)]
pub struct AutoscalerConfig {
    /// Path to a kubeconfig file. Empty to use the in-cluster config or `$KUBECONFIG`.
    #[arg(long, env = "AUTOSCALER_KUBECONFIG_PATH", default_value = "")]
    pub kubeconfig_path: String,

    /// Namespace to watch. Empty or `*` watches all namespaces.
    #[arg(long, env = "AUTOSCALER_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// How often the evaluator re-examines per-resource windows.
    #[arg(long, env = "AUTOSCALER_SCALE_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub scale_interval: Duration,

    /// How often the custom-metrics source is polled.
    #[arg(long, env = "AUTOSCALER_METRICS_POLL_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub metrics_poll_interval: Duration,

    /// Group/kind of the custom-metrics objects to poll (e.g. `external.metrics.k8s.io/v1beta1`).
    #[arg(long, env = "AUTOSCALER_METRICS_GROUP_KIND", default_value = "external.metrics.k8s.io/v1beta1")]
    pub metrics_group_kind: String,

    /// Name of the custom metric to poll.
    #[arg(long, env = "AUTOSCALER_METRICS_GROUP_NAME")]
    pub metrics_group_name: String,

    /// Bind address for the `/health/*` side-channel (never the metrics/scale path; there is no other HTTP surface on this binary).
    #[arg(long, env = "AUTOSCALER_HEALTH_ADDRESS", default_value = "0.0.0.0")]
    pub health_address: String,

    /// Bind port for the `/health/*` side-channel.
    #[arg(long, env = "AUTOSCALER_HEALTH_PORT", default_value_t = 8084)]
    pub health_port: u16,
}

/// Parse a duration string such as `30s`, `5m`, `250ms` (also accepts a bare integer as seconds).
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (number_part, unit) = value.split_at(
        value
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("invalid duration '{value}'"))?,
    );
    let number: f64 = number_part
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    let millis = match unit {
        "ms" => number,
        "s" => number * 1_000.0,
        "m" => number * 60_000.0,
        "h" => number * 3_600_000.0,
        other => return Err(format!("unknown duration unit '{other}' in '{value}'")),
    };
    Ok(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parses_suffixed_durations() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("5lightyears").is_err());
    }
}

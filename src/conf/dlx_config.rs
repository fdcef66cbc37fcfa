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

//! CLI configuration for the `dlx` (activation gateway) binary.

use clap::{Parser, ValueEnum};
use std::time::Duration;

use super::autoscaler_config::parse_duration;

/// Multi-target selection strategy used when a request resolves to more than one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MultiTargetStrategy {
    /// Always pick the first target in the list.
    Primary,
    /// Pick the second of exactly two targets (the canary); otherwise the only target.
    Canary,
    /// Uniformly pick among the targets at random.
    Random,
}

/// HTTP activation gateway: resolves scaled-to-zero targets, activates them, and reverse-proxies.
#[derive(Debug, Clone, Parser)]
#[command(name = "dlx", version, about)]
pub struct DlxConfig {
    /// Path to a kubeconfig file. Empty to use the in-cluster config or `$KUBECONFIG`.
    #[arg(long, env = "DLX_KUBECONFIG_PATH", default_value = "")]
    pub kubeconfig_path: String,

    /// Namespace to watch for ingresses. Empty or `*` watches all namespaces.
    #[arg(long, env = "DLX_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Request header carrying a comma-separated list of target resource names.
    #[arg(long, env = "DLX_TARGET_NAME_HEADER", default_value = "X-Target-Name")]
    pub target_name_header: String,

    /// Request header carrying the upstream path to forward to.
    #[arg(long, env = "DLX_TARGET_PATH_HEADER", default_value = "X-Target-Path")]
    pub target_path_header: String,

    /// TCP port exposed by resolved targets.
    #[arg(long, env = "DLX_TARGET_PORT", default_value_t = 8080)]
    pub target_port: u16,

    /// Address the proxy listens on.
    #[arg(long, env = "DLX_LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    pub listen_address: String,

    /// Upper bound on how long an activation may take before failing with `504`.
    #[arg(long, env = "DLX_RESOURCE_READINESS_TIMEOUT", default_value = "60s", value_parser = parse_duration)]
    pub resource_readiness_timeout: Duration,

    /// Strategy used to pick one target among several resolved candidates.
    #[arg(long, env = "DLX_MULTI_TARGET_STRATEGY", value_enum, default_value_t = MultiTargetStrategy::Random)]
    pub multi_target_strategy: MultiTargetStrategy,

    /// Bind address for the `/health/*` side-channel (kept off the proxy's own listener, see DESIGN.md).
    #[arg(long, env = "DLX_HEALTH_ADDRESS", default_value = "0.0.0.0")]
    pub health_address: String,

    /// Bind port for the `/health/*` side-channel.
    #[arg(long, env = "DLX_HEALTH_PORT", default_value_t = 8085)]
    pub health_port: u16,

    /// Deadline given to in-flight requests to drain on `Stop(ctx)` before the
    /// listener is force-closed.
    #[arg(long, env = "DLX_SHUTDOWN_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub shutdown_timeout: Duration,
}

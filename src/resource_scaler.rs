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

//! The sole integration point with the orchestrator: [ResourceScaler].
//!
//! Everything in this crate outside of [crate::kube_scaler] depends only on
//! this trait, never on `kube` types directly, so that the orchestrator can
//! in principle be swapped without touching the autoscaler, the activation
//! gateway or the ingress cache.

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::Resource;

/// Errors a [ResourceScaler] implementation may surface to its caller.
#[derive(Debug, Error)]
pub enum ScalerError {
    /// The orchestrator's API rejected or failed the scale request.
    #[error("scale request failed: {0}")]
    ScaleError(String),
    /// The orchestrator's API failed to enumerate resources.
    #[error("resource enumeration failed: {0}")]
    TransportError(String),
    /// The named resource has no resolvable network service name.
    #[error("could not resolve service name for resource '{0}'")]
    ResolutionError(String),
}

/// Optional startup overrides a [ResourceScaler] may supply, merged under CLI/env defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalerConfigOverride {
    /// Override for the autoscaler's evaluation interval.
    pub scale_interval: Option<std::time::Duration>,
    /// Override for the metrics poll interval.
    pub metrics_poll_interval: Option<std::time::Duration>,
}

/**
The abstracted control plane: enumerates resources, scales them to a
replica count, and resolves their network service names.

This is the only interface the core depends on for orchestrator access;
`spec.md` treats everything behind it (CLI argument parsing, Kubernetes API
plumbing, dynamic plug-in loading) as an external collaborator. This crate
links one concrete implementation ([crate::kube_scaler::KubeResourceScaler])
statically, since Rust's trait objects make dynamic `.so` loading pointless.
*/
#[async_trait]
pub trait ResourceScaler: Send + Sync {
    /// List all resources currently managed by this scaler.
    async fn get_resources(&self) -> Result<Vec<Resource>, ScalerError>;

    /// Set the replica count of every named resource to `replicas`.
    async fn set_scale(&self, resources: &[Resource], replicas: u32) -> Result<(), ScalerError>;

    /// Resolve a DNS-resolvable service name for a resource.
    async fn resolve_service_name(&self, resource: &Resource) -> Result<String, ScalerError>;

    /// Optional startup configuration override supplied by the orchestrator plug-in.
    fn get_config(&self) -> Option<ScalerConfigOverride> {
        None
    }
}

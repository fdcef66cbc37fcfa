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

//! Concrete [ResourceScaler] against Kubernetes `Deployment` scale subresources.
//!
//! Scale specs are read from annotations on the `Deployment`, filtered by a
//! configurable prefix, following the same annotation-prefix-filtering idiom
//! `ingress_monitor.rs` uses for µFE annotations.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};

use crate::conf::autoscaler_config::parse_duration;
use crate::resource::{Resource, ScaleSpec};
use crate::resource_scaler::{ResourceScaler, ScalerError};

/// [ResourceScaler] backed by Kubernetes `Deployment`s and `Service`s.
pub struct KubeResourceScaler {
    client: Client,
    namespace: Option<String>,
    annotation_prefix: String,
}

impl KubeResourceScaler {
    /// Build a new scaler. `namespace: None` watches every namespace.
    pub fn new(client: Client, namespace: Option<String>, annotation_prefix: String) -> Self {
        Self {
            client,
            namespace,
            annotation_prefix,
        }
    }

    fn deployments_api(&self) -> Api<Deployment> {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    /// Parse a `Deployment`'s annotations into a [Resource], if it carries a complete scale spec.
    fn to_resource(&self, deployment: &Deployment) -> Option<Resource> {
        let annotations = deployment.annotations();
        let metric_name = annotations
            .get(&format!("{}metric-name", self.annotation_prefix))?
            .clone();
        let window = annotations
            .get(&format!("{}window", self.annotation_prefix))
            .and_then(|value| parse_duration(value).ok())?;
        let threshold: i64 = annotations
            .get(&format!("{}threshold", self.annotation_prefix))
            .and_then(|value| value.parse().ok())?;
        Some(Resource {
            name: deployment.name_any(),
            namespace: deployment.namespace().unwrap_or_default(),
            scale_specs: vec![ScaleSpec {
                metric_name,
                window,
                threshold,
            }],
            last_scale_event: None,
        })
    }
}

#[async_trait]
impl ResourceScaler for KubeResourceScaler {
    async fn get_resources(&self) -> Result<Vec<Resource>, ScalerError> {
        let deployments = self
            .deployments_api()
            .list(&ListParams::default())
            .await
            .map_err(|e| ScalerError::TransportError(e.to_string()))?;
        Ok(deployments
            .into_iter()
            .filter_map(|deployment| self.to_resource(&deployment))
            .collect())
    }

    async fn set_scale(&self, resources: &[Resource], replicas: u32) -> Result<(), ScalerError> {
        for resource in resources {
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), &resource.namespace);
            let patch = serde_json::json!({ "spec": { "replicas": replicas } });
            api.patch_scale(&resource.name, &PatchParams::default(), &Patch::Merge(patch))
                .await
                .map_err(|e| ScalerError::ScaleError(e.to_string()))?;
            log::info!("scaled '{}' to {replicas} replica(s)", resource.key());
        }
        Ok(())
    }

    async fn resolve_service_name(&self, resource: &Resource) -> Result<String, ScalerError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &resource.namespace);
        api.get(&resource.name)
            .await
            .map(|_| format!("{}.{}.svc.cluster.local", resource.name, resource.namespace))
            .map_err(|e| ScalerError::ResolutionError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn deployment_with(annotations: BTreeMap<String, String>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("f".to_owned()),
                namespace: Some("default".to_owned()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(DeploymentSpec::default()),
            status: None,
        }
    }

    fn scaler() -> KubeResourceScaler {
        // `Client` requires a live config to construct; this test only
        // exercises the pure annotation-parsing path, which takes `&self`
        // but never touches `self.client`.
        KubeResourceScaler {
            client: Client::try_from(kube::Config::new("https://localhost".parse().unwrap()))
                .unwrap(),
            namespace: None,
            annotation_prefix: "scaler.mydriatech.io/".to_owned(),
        }
    }

    #[test]
    fn complete_annotations_produce_a_scale_spec() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "scaler.mydriatech.io/metric-name".to_owned(),
            "requests".to_owned(),
        );
        annotations.insert("scaler.mydriatech.io/window".to_owned(), "5m".to_owned());
        annotations.insert("scaler.mydriatech.io/threshold".to_owned(), "0".to_owned());
        let deployment = deployment_with(annotations);
        let resource = scaler().to_resource(&deployment).unwrap();
        assert_eq!(resource.name, "f");
        assert_eq!(resource.scale_specs.len(), 1);
        assert_eq!(resource.scale_specs[0].metric_name, "requests");
        assert_eq!(resource.scale_specs[0].threshold, 0);
    }

    #[test]
    fn missing_annotation_is_skipped() {
        let deployment = deployment_with(BTreeMap::new());
        assert!(scaler().to_resource(&deployment).is_none());
    }
}

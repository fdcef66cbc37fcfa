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

#![warn(missing_docs)]
#![doc(issue_tracker_base_url = "https://github.com/mydriatech/scaler-core/issues/")]

//! # Scale-to-zero activator for long-running services on Kubernetes.
//!
//! Two binaries share this library: `autoscaler` watches metrics and scales
//! idle resources to zero replicas, and `dlx` sits in front of scaled-to-zero
//! resources, activates them on first request, and reverse-proxies traffic
//! once they are ready.

pub mod autoscaler;
pub mod conf;
pub mod dlx_handler;
pub mod dlx_server;
pub mod health;
pub mod ingress_cache;
pub mod ingress_watcher;
pub mod kube_scaler;
pub mod metrics_poller;
pub mod metrics_source;
pub mod resource;
pub mod resource_scaler;
pub mod resource_starter;
mod time;

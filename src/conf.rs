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

//! Application configuration.
//!
//! Each binary (`autoscaler`, `dlx`) owns a `clap`-derived CLI config struct
//! in [autoscaler_config] / [dlx_config], layered CLI flag > env var >
//! built-in default via `clap`'s own `env` feature. [limits_config] is kept
//! as a standalone cgroup-aware detector used by both binaries to size
//! worker pools, since it has no user-facing flag of its own.

pub mod autoscaler_config;
pub mod dlx_config;
pub mod limits_config;

/// Package name reported by Cargo at build time.
const CARGO_PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version reported by Cargo at build time.
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/**
   The application name defaults to the Rust package name, but can be
   overridden with the environment variable `APP_NAME`.
*/
pub fn app_name_lowercase() -> String {
    std::env::var("APP_NAME")
        .map_err(|e| {
            log::debug!(
                "Environment variable APP_NAME: {e:?} -> Default app name '{}' will be used.",
                CARGO_PKG_NAME.to_owned()
            );
        })
        .ok()
        .map(|value| value.to_lowercase())
        .unwrap_or(CARGO_PKG_NAME.to_owned())
}

/// SemVer application version derived from the Rust package version.
pub fn app_version() -> &'static str {
    CARGO_PKG_VERSION
}

/**
   Read the Kubernetes namespace to operate in.

   Resolution order: the explicit `namespace` argument (when non-empty and
   not `*`), then the `SCALER_NAMESPACE` environment variable, then the
   in-cluster namespace file, finally `None` to mean "all namespaces".
*/
pub fn resolve_namespace(namespace_arg: &str) -> Option<String> {
    if !namespace_arg.is_empty() && namespace_arg != "*" {
        return Some(namespace_arg.to_owned());
    }
    if let Ok(env_namespace) = std::env::var("SCALER_NAMESPACE") {
        if !env_namespace.is_empty() {
            return Some(env_namespace);
        }
    }
    const IN_CLUSTER_NAMESPACE_FILE: &str =
        "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
    if let Ok(namespace) = std::fs::read_to_string(IN_CLUSTER_NAMESPACE_FILE) {
        let namespace = namespace.trim();
        if !namespace.is_empty() {
            return Some(namespace.to_owned());
        }
    }
    None
}

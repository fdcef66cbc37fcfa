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

//! Activation gateway entry point: watches ingresses, activates scaled-to-zero
//! targets on first request, and reverse-proxies traffic once they're ready.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use scaler_core::conf::dlx_config::DlxConfig;
use scaler_core::conf::limits_config::ResourceLimitsConfig;
use scaler_core::conf::{app_name_lowercase, resolve_namespace};
use scaler_core::dlx_handler::DlxHandler;
use scaler_core::dlx_server::DlxServer;
use scaler_core::health::{run_health_server, HealthState};
use scaler_core::ingress_cache::IngressHostCache;
use scaler_core::ingress_watcher::IngressWatcher;
use scaler_core::kube_scaler::KubeResourceScaler;
use scaler_core::resource_starter::ResourceStarter;

/// How long the initial ingress listing is given to complete before startup fails.
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Annotation carrying the comma-separated target resource names on an `Ingress`.
const TARGETS_ANNOTATION: &str = "scaler.mydriatech.io/targets";

/// Application entry point.
fn main() -> ExitCode {
    if let Err(e) = init_logger() {
        log::error!("Failed to initialize logging: {e:?}");
        return ExitCode::FAILURE;
    }
    let config = DlxConfig::parse();
    let limits = ResourceLimitsConfig::detect();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(limits.available_parallelism())
        .build()
        .unwrap()
        .block_on(run_async(config, limits.available_parallelism()))
}

/// Initialize the logging system and apply filters.
fn init_logger() -> Result<(), log::SetLoggerError> {
    let env_prefix = app_name_lowercase().to_uppercase();
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .filter(Some("actix_server"), log::LevelFilter::Warn)
        .filter(Some("rustls::client"), log::LevelFilter::Info)
        .filter(Some("rustls::common_state"), log::LevelFilter::Info)
        .filter(Some("hyper_util::client"), log::LevelFilter::Info)
        .filter(Some("kube_client::client"), log::LevelFilter::Info)
        .filter(Some("tower::buffer::worker"), log::LevelFilter::Info)
        .write_style(env_logger::fmt::WriteStyle::Auto)
        .target(env_logger::fmt::Target::Stdout)
        .is_test(false)
        .parse_env(
            env_logger::Env::new()
                .filter(env_prefix.to_owned() + "_LOG_LEVEL")
                .write_style(env_prefix.to_owned() + "_LOG_STYLE"),
        )
        .try_init()
}

/// Build a [kube::Client] from an explicit kubeconfig path, or the in-cluster/`$KUBECONFIG` default.
async fn build_kube_client(kubeconfig_path: &str) -> anyhow::Result<kube::Client> {
    if kubeconfig_path.is_empty() {
        return Ok(kube::Client::try_default().await?);
    }
    let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig_path)?;
    let kube_config = kube::Config::from_custom_kubeconfig(
        kubeconfig,
        &kube::config::KubeConfigOptions::default(),
    )
    .await?;
    Ok(kube::Client::try_from(kube_config)?)
}

/// Read the targets an `Ingress` activates, from its `scaler.mydriatech.io/targets` annotation.
fn resolve_targets(ingress: &k8s_openapi::api::networking::v1::Ingress) -> Vec<String> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(TARGETS_ANNOTATION))
        .map(|value| {
            value
                .split(',')
                .map(|name| name.trim().to_owned())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Async code entry point.
async fn run_async(config: DlxConfig, workers: usize) -> ExitCode {
    let client = match build_kube_client(&config.kubeconfig_path).await {
        Ok(client) => client,
        Err(e) => {
            log::error!("Failed to access Kubernetes API. Is this container deployed? {e:?}");
            return ExitCode::FAILURE;
        }
    };
    let namespace = resolve_namespace(&config.namespace);
    let health_state = HealthState::new();

    let cache = Arc::new(IngressHostCache::new());
    let watcher = IngressWatcher::new(Arc::clone(&cache), resolve_targets, INITIAL_SYNC_TIMEOUT);
    if let Err(e) = watcher
        .start(client.clone(), namespace.clone(), CancellationToken::new())
        .await
    {
        log::error!("Failed to establish initial ingress sync: {e}");
        return ExitCode::FAILURE;
    }

    let scaler: Arc<dyn scaler_core::resource_scaler::ResourceScaler> = Arc::new(
        KubeResourceScaler::new(
            client,
            namespace.clone(),
            "scaler.mydriatech.io/".to_owned(),
        ),
    );
    let resource_starter = ResourceStarter::new(Arc::clone(&scaler), config.resource_readiness_timeout);
    let handler = DlxHandler::new(
        cache,
        resource_starter,
        scaler,
        namespace.unwrap_or_default(),
        config.target_name_header.clone(),
        config.target_path_header.clone(),
        config.target_port,
        config.multi_target_strategy,
    );

    health_state.mark_started();
    health_state.set_ready(true);

    let (dlx_server, dlx_future) =
        match DlxServer::start(config.listen_address.clone(), workers, handler) {
            Ok(started) => started,
            Err(e) => {
                log::error!("Failed to bind activation gateway listener: {e:?}");
                return ExitCode::FAILURE;
            }
        };
    let health_future = run_health_server(
        config.health_address.clone(),
        config.health_port,
        Arc::clone(&health_state),
    );
    let signals_future = block_until_signaled();
    tokio::select! {
        result = dlx_future => {
            if let Err(e) = result {
                log::error!("Activation gateway server failed: {e:?}");
                return ExitCode::FAILURE;
            }
        },
        result = health_future => {
            if let Err(e) = result {
                log::error!("Health server failed: {e:?}");
                return ExitCode::FAILURE;
            }
        },
        _ = signals_future => {
            log::debug!("Shutdown signal received, draining within {:?}.", config.shutdown_timeout);
            dlx_server.stop(config.shutdown_timeout).await;
        },
    };
    ExitCode::SUCCESS
}

/// Block until SIGTERM or SIGINT is received.
async fn block_until_signaled() {
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    tokio::select! {
        _ = sigterm.recv() => {
            log::debug!("SIGTERM received.")
        },
        _ = sigint.recv() => {
            log::debug!("SIGINT received.")
        },
    };
}

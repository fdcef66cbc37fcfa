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

//! Metrics-driven scale-to-zero evaluator entry point.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

use scaler_core::autoscaler::Autoscaler;
use scaler_core::conf::autoscaler_config::AutoscalerConfig;
use scaler_core::conf::limits_config::ResourceLimitsConfig;
use scaler_core::conf::{app_name_lowercase, resolve_namespace};
use scaler_core::health::{run_health_server, HealthState};
use scaler_core::kube_scaler::KubeResourceScaler;
use scaler_core::metrics_poller::MetricsPoller;
use scaler_core::metrics_source::CustomMetricsSource;

/// Application entry point.
fn main() -> ExitCode {
    if let Err(e) = init_logger() {
        log::error!("Failed to initialize logging: {e:?}");
        return ExitCode::FAILURE;
    }
    let config = AutoscalerConfig::parse();
    let limits = ResourceLimitsConfig::detect();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(limits.available_parallelism())
        .build()
        .unwrap()
        .block_on(run_async(config))
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

/// Async code entry point.
async fn run_async(config: AutoscalerConfig) -> ExitCode {
    let client = match build_kube_client(&config.kubeconfig_path).await {
        Ok(client) => client,
        Err(e) => {
            log::error!("Failed to access Kubernetes API. Is this container deployed? {e:?}");
            return ExitCode::FAILURE;
        }
    };
    let namespace = resolve_namespace(&config.namespace);
    let health_state = HealthState::new();

    let scaler: Arc<dyn scaler_core::resource_scaler::ResourceScaler> = Arc::new(
        KubeResourceScaler::new(
            client.clone(),
            namespace.clone(),
            "scaler.mydriatech.io/".to_owned(),
        ),
    );
    let autoscaler = Autoscaler::new(Arc::clone(&scaler), config.scale_interval);
    autoscaler.start();

    let metrics_source = Arc::new(CustomMetricsSource::new(client));
    let poller = MetricsPoller::new(
        metrics_source,
        Arc::clone(&autoscaler),
        config.metrics_group_kind.clone(),
        config.metrics_group_name.clone(),
        namespace,
        config.metrics_poll_interval,
    );
    poller.start();

    health_state.mark_started();
    health_state.set_ready(true);

    let health_future = run_health_server(
        config.health_address.clone(),
        config.health_port,
        Arc::clone(&health_state),
    );
    let signals_future = block_until_signaled();
    tokio::select! {
        result = health_future => {
            if let Err(e) = result {
                log::error!("Health server failed: {e:?}");
                return ExitCode::FAILURE;
            }
        },
        _ = signals_future => {
            log::debug!("Shutdown signal received.");
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

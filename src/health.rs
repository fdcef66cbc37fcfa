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

//! Eclipse MicroProfile Health-style probes, served on a side-channel port.
//!
//! Neither binary's main listening port carries `/health` (the DLX's main
//! port must forward every path to a backend, see `dlx_handler`); both run
//! this small standalone server on a separate port instead.

use actix_web::http::StatusCode;
use actix_web::web::Data;
use actix_web::{get, App, HttpResponse, HttpServer, Responder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use utoipa::ToSchema;

/// Shared started/ready/live flags, updated by the component(s) being probed.
pub struct HealthState {
    started: AtomicBool,
    ready: AtomicBool,
    live: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Construct a health state that starts out down on every probe.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            live: AtomicBool::new(true),
        })
    }

    /// Mark startup as complete.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Relaxed);
    }

    /// Update readiness, e.g. once the first metrics poll or ingress sync completes.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Update liveness.
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    /// Whether startup has completed.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Whether the component is ready to serve traffic.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Whether the component is alive.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }
}

enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    fn http_status(&self) -> u16 {
        match self {
            Self::Up => 200,
            Self::Down => 503,
        }
    }

    fn status(&self) -> String {
        match self {
            Self::Up => "UP".to_owned(),
            Self::Down => "DOWN".to_owned(),
        }
    }

    fn as_response(&self) -> impl Responder {
        HttpResponse::build(StatusCode::from_u16(self.http_status()).unwrap())
            .json(HealthResponse {
                status: self.status(),
            })
    }
}

/// HTTP response body for health endpoints.
#[derive(ToSchema, Serialize)]
struct HealthResponse {
    status: String,
}

/// Combined started + readiness + liveness probe.
#[get("/health")]
async fn health(state: Data<Arc<HealthState>>) -> impl Responder {
    if state.is_started() && state.is_ready() && state.is_live() {
        HealthStatus::Up.as_response()
    } else {
        HealthStatus::Down.as_response()
    }
}

/// Kubernetes readiness probe.
#[get("/health/ready")]
async fn health_ready(state: Data<Arc<HealthState>>) -> impl Responder {
    if state.is_ready() {
        HealthStatus::Up.as_response()
    } else {
        HealthStatus::Down.as_response()
    }
}

/// Kubernetes liveness probe.
#[get("/health/live")]
async fn health_live(state: Data<Arc<HealthState>>) -> impl Responder {
    if state.is_live() {
        HealthStatus::Up.as_response()
    } else {
        HealthStatus::Down.as_response()
    }
}

/// Kubernetes startup probe.
#[get("/health/started")]
async fn health_started(state: Data<Arc<HealthState>>) -> impl Responder {
    if state.is_started() {
        HealthStatus::Up.as_response()
    } else {
        HealthStatus::Down.as_response()
    }
}

/// Bind and run the side-channel health server until the process is shut down.
pub async fn run_health_server(
    bind_address: String,
    bind_port: u16,
    state: Arc<HealthState>,
) -> std::io::Result<()> {
    log::info!("Health probes served on http://{bind_address}:{bind_port}/health");
    let app_data = Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(app_data.clone())
            .service(health)
            .service(health_ready)
            .service(health_live)
            .service(health_started)
    })
    .workers(1)
    .bind((bind_address, bind_port))?
    .disable_signals()
    .shutdown_timeout(5)
    .run()
    .await
}

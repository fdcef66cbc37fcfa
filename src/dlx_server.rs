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

//! HTTP listener for the activation gateway. Every path is forwarded to
//! [crate::dlx_handler::DlxHandler]; unlike `mydriatech-microfefind`'s
//! `rest_api.rs` there is no `/api/v1` scope here, since the whole point of
//! this listener is to be a catch-all reverse proxy.

use actix_web::dev::{Server, ServerHandle};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use std::sync::Arc;
use std::time::Duration;

use crate::dlx_handler::{DlxHandler, ProxyRequest};

/// Number of parallel requests that can be served for each assigned CPU core.
const WORKERS_PER_CORE: usize = 256;

/// Upper bound actix itself is given to drain connections once told to stop;
/// the caller-supplied deadline passed to [DlxServer::stop] is enforced on
/// top of this by forcing an immediate stop if it is exceeded.
const ACTIX_SHUTDOWN_TIMEOUT_SECS: u64 = 300;

async fn forward(
    request: HttpRequest,
    body: web::Payload,
    handler: web::Data<Arc<DlxHandler>>,
) -> HttpResponse {
    let host = request
        .connection_info()
        .host()
        .split(':')
        .next()
        .unwrap_or_default()
        .to_owned();
    let headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect();
    let proxy_request = ProxyRequest {
        method: request.method().clone(),
        host,
        path: request.path().to_owned(),
        headers,
    };
    match handler.handle(proxy_request, body).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("proxy request failed: {e:?}");
            HttpResponse::build(
                actix_web::http::StatusCode::from_u16(e.http_status())
                    .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR),
            )
            .finish()
        }
    }
}

/// Handle to a running [DlxServer], used to request graceful shutdown (`spec.md` §4.7).
pub struct DlxServer {
    handle: ServerHandle,
}

impl DlxServer {
    /// Bind the activation gateway's HTTP listener (`Start()`).
    ///
    /// Returns a [DlxServer] handle for [DlxServer::stop] alongside the
    /// `Server` future, which the caller must poll (typically inside a
    /// `tokio::select!`) to actually drive the listener.
    pub fn start(
        listen_address: String,
        workers: usize,
        handler: Arc<DlxHandler>,
    ) -> std::io::Result<(Self, Server)> {
        let max_connections = WORKERS_PER_CORE * workers;
        log::info!("Activation gateway listening on http://{listen_address} ({max_connections} max connections)");
        let app_data = web::Data::new(handler);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_data.clone())
                .default_service(web::route().to(forward))
        })
        .workers(workers)
        .backlog(u32::try_from(max_connections / 2).unwrap())
        .worker_max_blocking_threads(max_connections)
        .max_connections(max_connections)
        .bind(listen_address)?
        .disable_signals()
        .shutdown_timeout(ACTIX_SHUTDOWN_TIMEOUT_SECS)
        .run();
        let handle = server.handle();
        Ok((Self { handle }, server))
    }

    /// `Stop(ctx)`: request graceful shutdown, draining in-flight requests
    /// for up to `deadline` before forcing an immediate stop.
    pub async fn stop(&self, deadline: Duration) {
        if tokio::time::timeout(deadline, self.handle.stop(true))
            .await
            .is_err()
        {
            log::warn!(
                "activation gateway did not drain within {deadline:?}; forcing shutdown"
            );
            self.handle.stop(false).await;
        }
    }
}

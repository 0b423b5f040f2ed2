// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::{io, sync::Arc, time::Duration, net::SocketAddr};
use axum::{
    routing::get,
    Router,
    Extension,
};
use axum::response::{Json, IntoResponse};
use axum_server::tls_rustls::RustlsConfig;
use serde::Serialize;
use tokio::signal;

use relay_operator_common::constant::APP_NAME;
use relay_operator_common::telemetry::{create_trace_layer, error};
use relay_operator_controller::controller::context::Context;

use crate::router::v1::admission;

pub use axum_server::Handle;

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

pub fn create_router(ctx: Arc<Context>) -> Router {
    Router::new()
        .nest("/admission", admission::router())
        .layer(Extension(ctx))
        .layer(create_trace_layer())
        // Root endpoint after the tracing layer to ensure
        // that the root endpoint is not traced
        .route("/", get(|| async {
            let response = RootResponse {
                name: APP_NAME,
                version: env!("CARGO_PKG_VERSION"),
            };
            Json(response).into_response()
        }))
}

pub async fn create_tls_config(cert_file: String, key_file: String) -> io::Result<RustlsConfig> {
    RustlsConfig::from_pem_file(cert_file, key_file).await
}

pub async fn serve(addr: String, router: Router, tls_config: RustlsConfig, handle: Handle) -> io::Result<()> {
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address {}: {}", addr, e)))?;

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await
}

pub async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(event = "Error", error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(event = "Error", error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    }

    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

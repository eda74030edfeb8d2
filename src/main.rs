//! tusdrop server binary.
//!
//! A resumable (tus 1.0.0) upload server backed by a single storage
//! directory. Completed files can be listed and downloaded; unfinished
//! uploads survive restarts and are reconciled on startup.

mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod http;
mod locking;
mod logging;
mod protocol;
mod router;
mod sanitize;
mod storage;
mod store;
mod tls;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{any, get};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::UploadAuth;
use crate::background::spawn_background_tasks;
use crate::config::{Args, UPLOAD_PATH};
use crate::http::{RequestScheme, build_cors_layer, extract_forwarded_ip};
use crate::protocol::UploadProtocol;
use crate::storage::Storage;
use crate::store::UploadStore;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;

    let store = Arc::new(UploadStore::new(storage.clone(), args.store_config()));
    if let Err(err) = store.recover().await {
        warn!(error = %err, "upload recovery failed");
    }
    let protocol = Arc::new(UploadProtocol::new(
        store.clone(),
        UploadAuth::new(args.upload_password.clone()),
    ));

    let upload_item_path = format!("{UPLOAD_PATH}/{{id}}");
    let mut app = Router::new()
        .route(
            UPLOAD_PATH,
            any(upload::upload_collection).layer(DefaultBodyLimit::disable()),
        )
        .route(
            &upload_item_path,
            any(upload::upload_resource).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files", get(files::list_files))
        .route("/api/download/{name}", get(files::download_file))
        .route("/api/version", get(version::get_version_info))
        .route("/healthz", get(version::healthz))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = extract_forwarded_ip(request.headers())
                        .or(connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(storage))
        .layer(Extension(protocol));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    let https_server = match args.https_port {
        Some(port) => {
            let https_addr = SocketAddr::new(host, port);
            let tls_config =
                tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host)
                    .await?;
            info!("Starting HTTPS server at {}", https_addr);
            let https_app = app.clone().layer(Extension(RequestScheme::Https));
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(https_app.into_make_service_with_connect_info::<SocketAddr>()),
            )
        }
        None => None,
    };

    info!("Starting HTTP server at {}", http_addr);
    let http_app = app.layer(Extension(RequestScheme::Http));
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(store, Duration::from_secs(args.upload_expire_secs));

    let https_server = async move {
        match https_server {
            Some(server) => server.await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

//! AxoStatic server binary.
//!
//! Serves a directory tree over HTTP(S). Each configured user is
//! authenticated with HTTP Basic credentials, confined to a subdirectory and
//! URL prefix, and throttled by a per-user leaky bucket. The entry point
//! loads configuration, validates it, composes the middleware chain around
//! the file dispatcher and starts the listener.

mod auth;
mod config;
mod dispatcher;
mod error;
mod files;
mod http;
mod leaky_bucket;
mod logging;
mod prefix;
mod ratelimit;
mod storage;
mod tls;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum::middleware;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span, warn};

use crate::auth::{AuthService, BasicAuthService};
use crate::config::{Args, Conf, ConfigError};
use crate::dispatcher::RequestDispatcher;
use crate::http::{UiMount, build_cors_layer, resolve_client_ip};

shadow!(build);

/// Starts the AxoStatic server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    // 日志尚未初始化，加载失败只能通过返回的错误报告。
    let (mut conf, source) = Conf::load(&args.config)
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidInput, err))?;
    conf.apply_args(&args);
    logging::init_logging(&conf.log);
    match source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => warn!(path = %args.config, "config file not found, using defaults"),
    }

    let root = config::resolve_fs_root(&conf.server.fs_dir).map_err(invalid_config)?;
    let auth = BasicAuthService::new(conf.auth.user.clone(), conf.server.default_speed_limit);
    auth.check(&root).map_err(invalid_config)?;
    if let Some(username) = auth.single_user() {
        info!(username, "single user configured");
    }
    if !auth.is_enabled() {
        warn!("no users configured, authentication is disabled");
    }

    let host = conf
        .server
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, conf.server.port);
    let scheme = if conf.ssl.enabled { "https" } else { "http" };

    let mut dispatcher = RequestDispatcher::new(Arc::new(auth), root.clone(), &conf.server);
    if let Some(cors_layer) = build_cors_layer(&conf.cors) {
        dispatcher.add_middleware(move |router| router.layer(cors_layer));
    }
    if let Some(ui) = UiMount::from_conf(&conf.ui) {
        info!("UI available at {}://{}{}", scheme, addr, ui.prefix());
        dispatcher.add_middleware(move |router| ui.wrap(router));
    }
    dispatcher.add_middleware(|router| router.layer(middleware::from_fn(http::add_security_headers)));
    dispatcher.add_middleware(|router| {
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
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
    });
    let app = dispatcher
        .into_router()
        .into_make_service_with_connect_info::<SocketAddr>();

    info!("🚀 Serving {} at {}://{}{}", root.display(), scheme, addr, conf.server.path);
    info!("🔒 TLS {}", if conf.ssl.enabled { "enabled" } else { "disabled" });

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));
    let served = if conf.ssl.enabled {
        let tls_config = tls::build_rustls_config(&conf.ssl, &conf.server.host).await?;
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app)
            .await
    } else {
        axum_server::bind(addr).handle(handle).serve(app).await
    };

    if let Err(err) = served {
        error!(%addr, error = %err, "failed to listen and serve");
        return Err(err);
    }
    Ok(())
}

fn invalid_config(err: ConfigError) -> std::io::Error {
    error!(error = %err, "invalid configuration");
    std::io::Error::new(ErrorKind::InvalidInput, err)
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

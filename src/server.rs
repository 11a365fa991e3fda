//! Binding, serving and shutdown.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, extract::ConnectInfo, http::Request};
use futures::FutureExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::ServeError;
use crate::logging::{LogSink, TracingSink};
use crate::net::{find_free_port_with, local_addresses, port_is_free};
use crate::pipeline::Pipeline;

/// Pick the port to listen on.
///
/// Dynamic mode takes the first free port from `port` upward; fixed mode
/// checks up front that `port` is free so a clash fails with a clear error.
pub fn select_port(host: IpAddr, port: u16, dynamic: bool) -> Result<u16, ServeError> {
    if dynamic {
        return find_free_port_with(port, |candidate| port_is_free(host, candidate))
            .ok_or(ServeError::PortRangeExhausted(port));
    }

    if !port_is_free(host, port) {
        return Err(ServeError::PortInUse(port));
    }
    Ok(port)
}

/// Select a port per `config` and bind to it.
pub async fn bind(config: &PipelineConfig) -> Result<TcpListener, ServeError> {
    let port = select_port(config.host, config.port, config.port_dynamic)?;
    let listener = TcpListener::bind(SocketAddr::new(config.host, port)).await?;
    Ok(listener)
}

/// Accept connections and run each request through `pipeline` until
/// `shutdown` resolves.
///
/// Each connection runs on its own task. An aborted request makes the
/// connection service fail, which drops the connection without a response.
pub async fn serve<F>(listener: TcpListener, pipeline: Pipeline, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send,
{
    let service = ServiceBuilder::new()
        .layer(CatchPanicLayer::new())
        .service(pipeline);

    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = &mut shutdown => return Ok(()),
        };

        let service = service.clone();
        tokio::spawn(async move {
            let hyper_service = service_fn(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer));
                service
                    .clone()
                    .oneshot(request.map(Body::new))
                    .map(|result| result.map(|response| response.map(Body::new)))
                    .boxed()
            });

            let builder = auto::Builder::new(TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection(TokioIo::new(stream), hyper_service)
                .await
            {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}

/// Log the URLs the server can be reached at.
pub fn report_addresses(host: IpAddr, port: u16) {
    let addresses = local_addresses(host);
    match addresses.len() {
        0 => return,
        1 => info!("This server can be accessed from the following path:"),
        _ => info!("This server can be accessed from any of the following paths:"),
    }
    for address in addresses {
        info!("\thttp://{}:{}/", address, port);
    }
}

/// Start the server described by `config` and run until interrupted.
pub async fn run(config: PipelineConfig) -> Result<(), ServeError> {
    if config.serve_static {
        if !config.root.is_dir() {
            return Err(ServeError::InvalidRoot {
                path: config.root.clone(),
                reason: "not an existing directory".to_string(),
            });
        }
        info!("Serving files from: {}", config.root.display());
    } else {
        info!("Static file serving is disabled");
    }

    let sink: Arc<dyn LogSink> = Arc::new(TracingSink);
    let pipeline = Pipeline::assemble(&config, sink);
    debug!("Pipeline stages: {}", pipeline.stage_names().join(" -> "));

    let listener = bind(&config).await?;
    let local = listener.local_addr()?;
    info!("Listening on {}", local);
    report_addresses(config.host, local.port());

    serve(listener, pipeline, shutdown_signal()).await
}

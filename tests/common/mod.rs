//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
};
use peekserve::{Aborted, MemorySink, Pipeline, PipelineConfig, server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tower::ServiceExt;

/// Config serving `root` with every fault injector off.
pub fn config_for(root: &Path) -> PipelineConfig {
    PipelineConfig {
        root: root.to_path_buf(),
        ..PipelineConfig::default()
    }
}

/// Directory tree used by the static file tests.
pub fn fixture_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("readme.txt"), b"read me\n").unwrap();
    std::fs::write(dir.path().join("data.bin"), [0u8, 1, 2, 254, 255]).unwrap();
    std::fs::create_dir(dir.path().join("assets")).unwrap();
    std::fs::write(dir.path().join("assets").join("app.js"), b"console.log(1);").unwrap();
    std::fs::write(dir.path().join("assets").join("style.css"), b"body{}").unwrap();
    dir
}

/// Build the standard pipeline with a capturing sink.
pub fn pipeline(config: &PipelineConfig) -> (Pipeline, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    (Pipeline::assemble(config, sink.clone()), sink)
}

/// Send one request through the pipeline.
pub async fn send(pipeline: &Pipeline, method: Method, uri: &str) -> Result<Response, Aborted> {
    pipeline
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

/// A server running on an ephemeral localhost port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub sink: Arc<MemorySink>,
    _shutdown: oneshot::Sender<()>,
}

pub async fn spawn_server(config: PipelineConfig) -> TestServer {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (pipeline, sink) = pipeline(&config);
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(server::serve(listener, pipeline, async move {
        let _ = rx.await;
    }));

    TestServer {
        addr,
        sink,
        _shutdown: tx,
    }
}

/// Write a raw HTTP request and read until the server closes the connection.
pub async fn raw_request(addr: SocketAddr, request: &str) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}

/// `GET path` with `Connection: close`.
pub fn get_request(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
}

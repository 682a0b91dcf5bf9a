//! HTTP API server for the DataWeaver pipeline
//! Plain tokio TCP listener, one task per connection, JSON in and out.

use anyhow::{Context, Result};
use dataweaver::http::{read_request, route, HttpResponse, ReadError};
use dataweaver::error::ErrorKind;
use dataweaver::observability::init_tracing;
use dataweaver::{AppConfig, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing("info");

    let config = AppConfig::from_env().context("invalid configuration")?;
    info!("Starting DataWeaver API server...");
    info!("LLM provider: {}", config.llm.provider);
    if config.llm.api_key.is_none() && config.llm.provider != dataweaver::config::Provider::Offline {
        warn!("No API key configured for {}; requests will likely be rejected", config.llm.provider);
    }

    let pipeline = Arc::new(Pipeline::from_config(&config).with_context(|| {
        format!(
            "failed to load data from {}; run `dataweaver seed` first",
            config.data_dir.display()
        )
    })?);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("Server listening on http://{}", config.bind_addr);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        debug!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, Arc::clone(&pipeline)));
    }
}

async fn handle_connection(mut stream: TcpStream, pipeline: Arc<Pipeline>) {
    let (mut reader, mut writer) = stream.split();

    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut reader)).await {
        Ok(Ok(request)) => request,
        Ok(Err(ReadError::Closed)) => return,
        Ok(Err(ReadError::TooLarge)) => {
            let resp = HttpResponse::error(413, ErrorKind::Malformed, "request too large");
            let _ = writer.write_all(resp.render().as_bytes()).await;
            return;
        }
        Ok(Err(ReadError::Malformed(detail))) => {
            let resp = HttpResponse::error(400, ErrorKind::Malformed, &detail);
            let _ = writer.write_all(resp.render().as_bytes()).await;
            return;
        }
        Ok(Err(ReadError::Io(detail))) => {
            warn!("Failed to read from stream: {}", detail);
            return;
        }
        Err(_) => {
            let resp = HttpResponse::error(400, ErrorKind::Malformed, "timed out reading request");
            let _ = writer.write_all(resp.render().as_bytes()).await;
            return;
        }
    };

    info!("{} {}", request.method, request.path);

    // Dropping the route future cancels in-flight model calls and the executor wait.
    let response = tokio::select! {
        response = route(&pipeline, &request) => response,
        _ = client_gone(&mut reader) => {
            info!("Client disconnected, cancelling {} {}", request.method, request.path);
            return;
        }
    };

    if let Err(e) = writer.write_all(response.render().as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
    let _ = writer.shutdown().await;
}

/// Resolves once the peer closes its side of the connection.
async fn client_gone<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

// JVMTI core harness
//
// Drives the instrumentation core over line-delimited JSON-RPC on stdio

use anyhow::{Context, Result};
use jvmti_core::InstrumentationConfig;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, error, info};

mod handlers;
mod ops;
mod protocol;
mod session;

use handlers::RequestHandler;
use protocol::*;
use session::HarnessSession;

const CONFIG_ENV: &str = "JVMTI_CORE_CONFIG";

fn load_config() -> Result<InstrumentationConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok());

    match path {
        Some(path) => {
            info!("Loading config from {}", path);
            InstrumentationConfig::from_path(&path)
                .with_context(|| format!("Failed to load config from {}", path))
        }
        None => Ok(InstrumentationConfig::default()),
    }
}

async fn write_response(stdout: &mut Stdout, response: &JsonRpcResponse) -> Result<()> {
    let response_str = serde_json::to_string(response)?;
    debug!("Sending: {}", response_str);
    stdout.write_all(response_str.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

fn error_response(code: i32, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: Value::Null,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        }),
    }
}

// Single-threaded so every op runs on the same agent thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout is reserved for JSON-RPC protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jvmti_harness=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting JVMTI core harness...");

    let config = load_config()?;
    let handler = RequestHandler::new(HarnessSession::new(config)?);

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    info!("JVMTI harness ready, waiting for requests...");

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                debug!("Received: {}", line);

                let value = match serde_json::from_str::<Value>(line) {
                    Ok(value) => value,
                    Err(e) => {
                        error!("Parse error: {}", e);
                        write_response(&mut stdout, &error_response(PARSE_ERROR, "Parse error")).await?;
                        continue;
                    }
                };

                // Requests carry an id, notifications do not
                if value.get("id").is_some() {
                    match serde_json::from_value::<JsonRpcRequest>(value) {
                        Ok(request) => {
                            let response = handler.handle_request(request).await;
                            write_response(&mut stdout, &response).await?;
                        }
                        Err(e) => {
                            error!("Invalid request: {}", e);
                            write_response(&mut stdout, &error_response(INVALID_REQUEST, "Invalid request"))
                                .await?;
                        }
                    }
                } else {
                    match serde_json::from_value::<JsonRpcNotification>(value) {
                        Ok(notification) => handler.handle_notification(notification).await,
                        Err(e) => error!("Invalid notification: {}", e),
                    }
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    info!("JVMTI harness shutting down");
    Ok(())
}

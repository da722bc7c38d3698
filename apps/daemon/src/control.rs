use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

use crate::cli::StatusFormat;

fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")
}

/// Ask a running daemon to stop, then wait for its socket to go quiet.
pub async fn stop(port: u16, force: bool, timeout_secs: u64) -> Result<()> {
    let client = client()?;
    client
        .post(format!("{}/api/v1/daemon/stop", base_url(port)))
        .json(&json!({ "force": force }))
        .send()
        .await
        .context("No daemon is listening on the local socket")?
        .error_for_status()
        .context("Daemon rejected the stop request")?;

    let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(1));
    loop {
        match client
            .get(format!("{}/healthz", base_url(port)))
            .send()
            .await
        {
            Err(_) => {
                println!("daemon stopped");
                return Ok(());
            }
            Ok(_) if Instant::now() >= deadline => {
                return Err(anyhow!("daemon did not stop within {timeout_secs}s"));
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

pub async fn reload(port: u16) -> Result<()> {
    client()?
        .post(format!("{}/api/v1/daemon/reload", base_url(port)))
        .send()
        .await
        .context("No daemon is listening on the local socket")?
        .error_for_status()
        .context("Daemon rejected the reload request")?;

    println!("reload requested");
    Ok(())
}

pub async fn status(
    port: u16,
    format: StatusFormat,
    include_health: bool,
    include_performance: bool,
) -> Result<()> {
    let client = client()?;

    let mut status: Value = client
        .get(format!("{}/api/v1/status", base_url(port)))
        .send()
        .await
        .context("No daemon is listening on the local socket")?
        .error_for_status()
        .context("Daemon rejected the status request")?
        .json()
        .await
        .context("Failed to parse status response")?;

    if include_health {
        let health: Value = client
            .get(format!("{}/healthz", base_url(port)))
            .send()
            .await
            .context("Health check failed")?
            .json()
            .await
            .context("Failed to parse health response")?;
        status["health"] = health;
    }

    if !include_performance {
        if let Some(object) = status.as_object_mut() {
            object.remove("performance");
        }
    }

    match format {
        StatusFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        StatusFormat::Table => print_status_table(&status),
    }

    Ok(())
}

fn print_status_table(status: &Value) {
    if let Some(uptime) = status.get("uptimeSecs").and_then(Value::as_u64) {
        println!("uptime: {uptime}s");
    }
    if let Some(health) = status.get("health").and_then(|health| health.get("status")) {
        println!("health: {}", health.as_str().unwrap_or("unknown"));
    }
    if let Some(performance) = status.get("performance") {
        println!(
            "operations: {} active, {} queued, {} completed, {} failed",
            performance.get("activeOperations").and_then(Value::as_u64).unwrap_or(0),
            performance.get("queuedOperations").and_then(Value::as_u64).unwrap_or(0),
            performance.get("completed").and_then(Value::as_u64).unwrap_or(0),
            performance.get("failed").and_then(Value::as_u64).unwrap_or(0),
        );
    }

    let Some(folders) = status
        .pointer("/ingest/folders")
        .and_then(Value::as_array)
    else {
        return;
    };

    println!("{:<40} {:<18} {:>9} {:>8} {:>10}", "FOLDER", "STATUS", "PROGRESS", "DOCS", "CHUNKS");
    for folder in folders {
        let path = folder.get("path").and_then(Value::as_str).unwrap_or("?");
        let state = folder.get("status").and_then(Value::as_str).unwrap_or("?");
        let progress = folder
            .pointer("/progress/percentage")
            .and_then(Value::as_u64)
            .map(|value| format!("{value}%"))
            .unwrap_or_else(|| "-".to_string());
        let docs = folder
            .pointer("/stats/documents")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let chunks = folder
            .pointer("/stats/chunks")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        println!("{path:<40} {state:<18} {progress:>9} {docs:>8} {chunks:>10}");
    }
}

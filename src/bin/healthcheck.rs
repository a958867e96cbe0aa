//! Liveness/readiness probe for the OCR server.
//!
//! Exits 0 only when `GET /health` answers 200 with `ocr_ready: true`.
//! Target URL comes from `OCR_HEALTH_URL`, else `http://localhost:$OCR_PORT/health`.

use std::process::ExitCode;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    ocr_ready: bool,
}

#[derive(Debug, PartialEq)]
enum Verdict {
    Healthy,
    NotReady,
    HttpStatus(u16),
    BadBody(String),
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Healthy => write!(f, "OCR server healthy"),
            Verdict::NotReady => write!(f, "OCR not ready"),
            Verdict::HttpStatus(code) => write!(f, "HTTP {}", code),
            Verdict::BadBody(e) => write!(f, "unreadable health body: {}", e),
        }
    }
}

fn evaluate(status: u16, body: &str) -> Verdict {
    if status != 200 {
        return Verdict::HttpStatus(status);
    }
    match serde_json::from_str::<HealthBody>(body) {
        Ok(health) if health.ocr_ready => Verdict::Healthy,
        Ok(_) => Verdict::NotReady,
        Err(e) => Verdict::BadBody(e.to_string()),
    }
}

fn health_url() -> String {
    std::env::var("OCR_HEALTH_URL").unwrap_or_else(|_| {
        let port = std::env::var("OCR_PORT").unwrap_or_else(|_| "8501".to_string());
        format!("http://localhost:{}/health", port)
    })
}

async fn check(url: &str, timeout: Duration) -> anyhow::Result<Verdict> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            anyhow::anyhow!("timeout after {:?}", timeout)
        } else if e.is_connect() {
            anyhow::anyhow!("connection refused")
        } else {
            anyhow::anyhow!(e)
        }
    })?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok(evaluate(status, &body))
}

#[tokio::main]
async fn main() -> ExitCode {
    let timeout = std::env::var("OCR_HEALTH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let url = health_url();

    match check(&url, Duration::from_secs(timeout)).await {
        Ok(Verdict::Healthy) => {
            println!("Health check: {}", Verdict::Healthy);
            ExitCode::SUCCESS
        }
        Ok(verdict) => {
            eprintln!("Health check failed: {}", verdict);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Health check failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

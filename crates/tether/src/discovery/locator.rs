//! Finding a running CLI server on localhost.

use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::process::Command;

static LSOF_LISTEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"opencode.*TCP\s+127\.0\.0\.1:(\d+)\s+\(LISTEN\)").expect("valid lsof regex")
});

#[async_trait]
pub trait ServerLocator: Send + Sync {
    /// Base URL of a running server, if any.
    async fn locate(&self) -> Option<String>;
}

/// A fixed, configured server URL.
#[derive(Debug, Clone)]
pub struct StaticLocator {
    url: Option<String>,
}

impl StaticLocator {
    pub fn new(url: Option<String>) -> Self {
        Self { url }
    }
}

#[async_trait]
impl ServerLocator for StaticLocator {
    async fn locate(&self) -> Option<String> {
        self.url.clone()
    }
}

/// Scans `lsof -i -P -n` for an `opencode` process listening on 127.0.0.1.
#[derive(Debug, Clone)]
pub struct LsofLocator {
    timeout: Duration,
}

impl LsofLocator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// First listening port in `lsof` output, as a base URL.
pub(crate) fn parse_lsof(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        LSOF_LISTEN
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|port| format!("http://127.0.0.1:{}", port.as_str()))
    })
}

#[async_trait]
impl ServerLocator for LsofLocator {
    async fn locate(&self) -> Option<String> {
        let output = Command::new("lsof")
            .args(["-i", "-P", "-n"])
            .kill_on_drop(true)
            .output();
        let stdout = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(out)) => String::from_utf8_lossy(&out.stdout).into_owned(),
            Ok(Err(e)) => {
                debug!("lsof unavailable: {}", e);
                return None;
            }
            Err(_) => {
                debug!("lsof timed out after {:?}", self.timeout);
                return None;
            }
        };
        let url = parse_lsof(&stdout);
        match &url {
            Some(url) => info!("found opencode server at {}", url),
            None => debug!("no listening opencode server found"),
        }
        url
    }
}

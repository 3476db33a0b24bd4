//! Headless rendering behind a bounded pool. The browser itself is an
//! external service: a node script that navigates an isolated context (no
//! cookies, no storage, no session reuse), waits for the configured trigger
//! plus a stability pause, and prints the serialized DOM as JSON on stdout:
//!
//! ```json
//! {"html": "<!doctype html>...", "warnings": ["..."]}
//! {"error": "net::ERR_NAME_NOT_RESOLVED"}
//! {"ineligible_type": "application/pdf"}
//! ```

pub mod cache;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("render timed out after {0} ms")]
    Timeout(u64),
    #[error("render failed: {0}")]
    Failed(String),
    #[error("content type not renderable: {0}")]
    IneligibleType(String),
}

/// When the renderer considers navigation settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    Load,
    Domcontentloaded,
    NetworkIdle,
}

/// Per-render settings handed to the browser script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderPolicy {
    pub wait_until: WaitUntil,
    pub goto_timeout_ms: u64,
    pub stability_ms: u64,
    pub hydration_wait_ms: u64,
    pub viewport_w: u32,
    pub viewport_h: u32,
}

impl Default for RenderPolicy {
    fn default() -> Self {
        RenderPolicy {
            wait_until: WaitUntil::NetworkIdle,
            goto_timeout_ms: 30_000,
            stability_ms: 5_000,
            hydration_wait_ms: 8_000,
            viewport_w: 1280,
            viewport_h: 800,
        }
    }
}

/// Serialized DOM after the wait trigger and stability pause.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub body: String,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RenderOutput {
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ineligible_type: Option<String>,
}

fn parse_render_output(stdout: &str, elapsed_ms: u64) -> Result<RenderedArtifact, RenderError> {
    let parsed: RenderOutput = serde_json::from_str(stdout)
        .map_err(|e| RenderError::Failed(format!("bad renderer output: {e}")))?;

    if let Some(ct) = parsed.ineligible_type {
        return Err(RenderError::IneligibleType(ct));
    }
    if let Some(err) = parsed.error {
        return Err(RenderError::Failed(err));
    }
    match parsed.html {
        Some(body) => Ok(RenderedArtifact {
            body,
            warnings: parsed.warnings,
            elapsed_ms,
        }),
        None => Err(RenderError::Failed("renderer returned no html".to_string())),
    }
}

/// Bounded pool of headless browser contexts, one subprocess call per render.
#[derive(Clone)]
pub struct Renderer {
    semaphore: Arc<Semaphore>,
    script_path: String,
    policy: RenderPolicy,
}

impl Renderer {
    pub fn new(max_concurrent: usize, script_path: String, policy: RenderPolicy) -> Self {
        Renderer {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            script_path,
            policy,
        }
    }

    pub fn policy(&self) -> &RenderPolicy {
        &self.policy
    }

    /// Total wall-clock budget for one render call: navigation plus hydration
    /// plus the stability pause, with slack for process startup.
    fn deadline(&self) -> Duration {
        Duration::from_millis(
            self.policy.goto_timeout_ms + self.policy.hydration_wait_ms + self.policy.stability_ms,
        ) + Duration::from_secs(5)
    }

    /// Render a page and return the settled DOM serialization.
    pub async fn render(&self, url: &str) -> Result<RenderedArtifact, RenderError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| RenderError::Failed(e.to_string()))?;

        let policy_json = serde_json::to_string(&self.policy)
            .map_err(|e| RenderError::Failed(e.to_string()))?;
        let started = Instant::now();
        let deadline = self.deadline();

        let output = tokio::time::timeout(
            deadline,
            tokio::process::Command::new("node")
                .arg(&self.script_path)
                .arg(url)
                .arg(&policy_json)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| RenderError::Timeout(deadline.as_millis() as u64))?
        .map_err(|e| RenderError::Failed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_render_output(&stdout, started.elapsed().as_millis() as u64)
    }
}

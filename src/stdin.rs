use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::first_present;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StdinSnapshot {
    pub transcript_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub session_id: Option<String>,
    pub model: Option<ModelInfo>,
    pub context_window: Option<ContextWindow>,
    pub cost: Option<SessionCost>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModelInfo {
    pub id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ContextWindow {
    pub context_window_size: Option<u64>,
    pub current_usage: Option<CurrentUsage>,
    pub used_percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CurrentUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionCost {
    pub total_cost_usd: Option<f64>,
}

impl StdinSnapshot {
    pub fn model_id(&self) -> Option<&str> {
        self.model.as_ref()?.id.as_deref()
    }

    pub fn model_name(&self) -> &str {
        self.model
            .as_ref()
            .and_then(|model| model.display_name.as_deref().or(model.id.as_deref()))
            .unwrap_or("unknown")
    }

    /// Bedrock model ids embed the vendor prefix `anthropic.claude-`.
    pub fn provider_label(&self) -> Option<&'static str> {
        let id = self.model_id()?.to_ascii_lowercase();
        id.contains("anthropic.claude-").then_some("Bedrock")
    }

    fn usage(&self) -> Option<&CurrentUsage> {
        self.context_window.as_ref()?.current_usage.as_ref()
    }

    /// Input tokens including both cache buckets.
    pub fn total_input_tokens(&self) -> u64 {
        self.usage().map_or(0, |usage| {
            usage.input_tokens.unwrap_or(0)
                + usage.cache_creation_input_tokens.unwrap_or(0)
                + usage.cache_read_input_tokens.unwrap_or(0)
        })
    }

    pub fn output_tokens(&self) -> u64 {
        self.usage().and_then(|usage| usage.output_tokens).unwrap_or(0)
    }

    pub fn session_cost_usd(&self) -> Option<f64> {
        self.cost
            .as_ref()?
            .total_cost_usd
            .filter(|cost| cost.is_finite() && *cost >= 0.0)
    }

    /// Context window usage in whole percent. The value reported by the host
    /// wins; otherwise it is computed from the token counts.
    pub fn context_percent(&self) -> Option<u8> {
        let native = || self.native_percent();
        let computed = || self.computed_percent();
        let providers: [&dyn Fn() -> Option<u8>; 2] = [&native, &computed];
        first_present(&providers)
    }

    fn native_percent(&self) -> Option<u8> {
        let pct = self.context_window.as_ref()?.used_percentage?;
        if !pct.is_finite() {
            return None;
        }
        Some(pct.round().clamp(0.0, 100.0) as u8)
    }

    fn computed_percent(&self) -> Option<u8> {
        let window = self.context_window.as_ref()?.context_window_size?;
        if window == 0 {
            return None;
        }
        let pct = self.total_input_tokens() as f64 / window as f64 * 100.0;
        Some(pct.round().min(100.0) as u8)
    }
}

/// `None` when stdin is a terminal, empty, or not a JSON object.
pub fn read_stdin() -> Option<StdinSnapshot> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return None;
    }
    read_snapshot(stdin.lock())
}

pub fn read_snapshot(mut reader: impl Read) -> Option<StdinSnapshot> {
    let mut raw = String::new();
    if let Err(err) = reader.read_to_string(&mut raw) {
        debug!(error = %err, "failed to read stdin");
        return None;
    }
    parse_snapshot(&raw)
}

pub fn parse_snapshot(raw: &str) -> Option<StdinSnapshot> {
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(raw) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            debug!(error = %err, "ignoring malformed stdin snapshot");
            None
        }
    }
}

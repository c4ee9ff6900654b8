use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{CacheBackend, CacheStore, FileBackend, TtlRule};
use crate::transcript::ToolCall;
use crate::util::{format_session_duration, format_tokens};

pub const STATS_CACHE_VERSION: &str = "1";
const STATS_CACHE_KEY: &str = "history_stats";
const NO_TOOL: &str = "N/A";
const MAX_COUNTED_TOOL_IDS: usize = 200;
const MAX_TRACKED_SESSIONS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionStats {
    pub total_sessions: u64,
    pub total_tokens_used: u64,
    pub total_duration_ms: u64,
    pub total_cost: f64,
    pub most_used_tool: String,
    pub most_used_tool_count: u64,
    pub tool_usage: BTreeMap<String, u64>,
    pub average_tokens_per_session: f64,
    pub last_update_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    recent: Vec<SessionContribution>,
}

/// What a recently seen session has added so far, so later renders of it
/// replace rather than repeat its contribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
struct SessionContribution {
    id: String,
    tokens: u64,
    duration_ms: u64,
    cost: f64,
    counted_tool_ids: Vec<String>,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            total_sessions: 0,
            total_tokens_used: 0,
            total_duration_ms: 0,
            total_cost: 0.0,
            most_used_tool: NO_TOOL.to_string(),
            most_used_tool_count: 0,
            tool_usage: BTreeMap::new(),
            average_tokens_per_session: 0.0,
            last_update_date: None,
            recent: Vec::new(),
        }
    }
}

impl SessionStats {
    /// Percent.
    pub fn top_tool_share(&self) -> Option<f64> {
        let total: u64 = self.tool_usage.values().sum();
        if self.most_used_tool_count == 0 || total == 0 {
            return None;
        }
        Some(self.most_used_tool_count as f64 / total as f64 * 100.0)
    }

    /// `Session #3 | Total: 1.2M | Avg: 400.0K/session | Top tool: Read (41%)`
    pub fn summary_line(&self) -> String {
        let mut parts = vec![
            format!("Session #{}", self.total_sessions),
            format!("Total: {}", format_tokens(self.total_tokens_used)),
            format!(
                "Avg: {}/session",
                format_tokens(self.average_tokens_per_session.round() as u64)
            ),
        ];
        if let Some(share) = self.top_tool_share() {
            parts.push(format!("Top tool: {} ({share:.0}%)", self.most_used_tool));
        }
        parts.join(" | ")
    }

    fn count_tool(&mut self, name: &str) {
        *self.tool_usage.entry(name.to_string()).or_default() += 1;
    }

    fn refresh_derived(&mut self, today: NaiveDate) {
        self.average_tokens_per_session = if self.total_sessions == 0 {
            0.0
        } else {
            self.total_tokens_used as f64 / self.total_sessions as f64
        };

        // strict comparison keeps the first maximum in key order
        let mut top = (NO_TOOL, 0);
        for (name, &count) in &self.tool_usage {
            if count > top.1 {
                top = (name.as_str(), count);
            }
        }
        self.most_used_tool = top.0.to_string();
        self.most_used_tool_count = top.1;
        self.last_update_date = Some(today);
    }
}

pub struct SessionStatsStore<B = FileBackend> {
    store: CacheStore<SessionStats, B>,
}

impl SessionStatsStore {
    pub fn open(path: PathBuf) -> Self {
        Self::with_backend(FileBackend::new(path))
    }
}

impl<B: CacheBackend> SessionStatsStore<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            store: CacheStore::new(backend, STATS_CACHE_VERSION, TtlRule::Never, 1),
        }
    }

    pub fn load(&self) -> SessionStats {
        self.store.get(STATS_CACHE_KEY).unwrap_or_default()
    }

    /// Adds one whole session: every tool in `tools` counts once by name.
    pub fn update(
        &self,
        tokens: u64,
        duration_ms: u64,
        cost: f64,
        tools: &[ToolCall],
        now: DateTime<Utc>,
    ) -> SessionStats {
        let cost = sanitize_cost(cost);
        self.store.update_at(STATS_CACHE_KEY, now, |current| {
            let mut stats = current.unwrap_or_default();
            stats.total_sessions += 1;
            stats.total_tokens_used += tokens;
            stats.total_duration_ms += duration_ms;
            stats.total_cost += cost;
            for tool in tools {
                stats.count_tool(&tool.name);
            }
            stats.refresh_derived(local_date(now));
            stats
        })
    }

    /// Renders of a recently seen session replace its earlier contribution;
    /// tool ids are counted once.
    pub fn record_session(
        &self,
        session_id: &str,
        tokens: u64,
        duration_ms: u64,
        cost: f64,
        tools: &[ToolCall],
        now: DateTime<Utc>,
    ) -> SessionStats {
        let cost = sanitize_cost(cost);
        self.store.update_at(STATS_CACHE_KEY, now, |current| {
            let mut stats = current.unwrap_or_default();
            let previous = stats
                .recent
                .iter()
                .position(|seen| seen.id == session_id)
                .map(|index| stats.recent.remove(index));
            let mut contribution = match previous {
                Some(previous) => {
                    stats.total_tokens_used = stats.total_tokens_used.saturating_sub(previous.tokens);
                    stats.total_duration_ms =
                        stats.total_duration_ms.saturating_sub(previous.duration_ms);
                    stats.total_cost = (stats.total_cost - previous.cost).max(0.0);
                    previous
                }
                None => {
                    stats.total_sessions += 1;
                    SessionContribution {
                        id: session_id.to_string(),
                        ..SessionContribution::default()
                    }
                }
            };

            stats.total_tokens_used += tokens;
            stats.total_duration_ms += duration_ms;
            stats.total_cost += cost;
            contribution.tokens = tokens;
            contribution.duration_ms = duration_ms;
            contribution.cost = cost;

            let mut counted: HashSet<String> = contribution.counted_tool_ids.iter().cloned().collect();
            for tool in tools {
                if counted.insert(tool.id.clone()) {
                    contribution.counted_tool_ids.push(tool.id.clone());
                    stats.count_tool(&tool.name);
                }
            }
            let excess = contribution
                .counted_tool_ids
                .len()
                .saturating_sub(MAX_COUNTED_TOOL_IDS);
            contribution.counted_tool_ids.drain(..excess);

            stats.recent.push(contribution);
            let excess = stats.recent.len().saturating_sub(MAX_TRACKED_SESSIONS);
            stats.recent.drain(..excess);
            stats.refresh_derived(local_date(now));
            stats
        })
    }

    pub fn summary(&self) -> String {
        let stats = self.load();
        let mut out = String::new();
        let _ = writeln!(out, "Sessions:          {}", stats.total_sessions);
        let _ = writeln!(out, "Total tokens:      {}", format_tokens(stats.total_tokens_used));
        let _ = writeln!(
            out,
            "Avg per session:   {}",
            format_tokens(stats.average_tokens_per_session.round() as u64)
        );
        let _ = writeln!(
            out,
            "Total duration:    {}",
            format_session_duration(Duration::from_millis(stats.total_duration_ms))
        );
        let _ = writeln!(out, "Total cost:        ${:.2}", stats.total_cost);
        if let Some(share) = stats.top_tool_share() {
            let _ = writeln!(
                out,
                "Most used tool:    {} ({} calls, {share:.1}%)",
                stats.most_used_tool, stats.most_used_tool_count
            );
        }
        match stats.last_update_date {
            Some(date) => {
                let _ = writeln!(out, "Last updated:      {date}");
            }
            None => {
                let _ = writeln!(out, "Last updated:      never");
            }
        }
        out
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn store(&self) -> &CacheStore<SessionStats, B> {
        &self.store
    }
}

fn sanitize_cost(cost: f64) -> f64 {
    if cost.is_finite() && cost > 0.0 { cost } else { 0.0 }
}

fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, millis_to_datetime};
    use crate::transcript::ToolState;

    fn at(ms: i64) -> DateTime<Utc> {
        millis_to_datetime(ms).expect("valid millis")
    }

    fn tool(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            target: None,
            status: ToolState::Completed,
            started_at: at(0),
            finished_at: Some(at(1)),
        }
    }

    #[test]
    fn empty_stats_have_no_top_tool() {
        let backend = MemoryBackend::new();
        let stats = SessionStatsStore::with_backend(&backend).load();

        assert_eq!(stats.most_used_tool, "N/A");
        assert_eq!(stats.top_tool_share(), None);
        assert_eq!(stats.summary_line(), "Session #0 | Total: 0 | Avg: 0/session");
    }

    #[test]
    fn update_accumulates_and_averages() {
        let backend = MemoryBackend::new();
        let store = SessionStatsStore::with_backend(&backend);

        store.update(1_000, 60_000, 0.5, &[tool("a", "Read")], at(0));
        let stats = store.update(3_000, 120_000, 0.25, &[tool("b", "Edit")], at(1_000));

        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_tokens_used, 4_000);
        assert_eq!(stats.total_duration_ms, 180_000);
        assert!((stats.total_cost - 0.75).abs() < 1e-9);
        assert!((stats.average_tokens_per_session - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn most_used_tool_ties_go_to_first_key() {
        let backend = MemoryBackend::new();
        let store = SessionStatsStore::with_backend(&backend);

        let stats = store.update(
            0,
            0,
            0.0,
            &[tool("1", "Read"), tool("2", "Bash"), tool("3", "Read"), tool("4", "Bash")],
            at(0),
        );

        assert_eq!(stats.most_used_tool, "Bash");
        assert_eq!(stats.most_used_tool_count, 2);
        assert_eq!(stats.top_tool_share(), Some(50.0));

        let stats = store.update(0, 0, 0.0, &[tool("5", "Read")], at(0));
        assert_eq!(stats.most_used_tool, "Read");
        assert_eq!(stats.most_used_tool_count, 3);
    }

    #[test]
    fn repeated_renders_of_a_session_replace_its_contribution() {
        let backend = MemoryBackend::new();
        let store = SessionStatsStore::with_backend(&backend);

        store.record_session("s1", 1_000, 10_000, 0.1, &[tool("a", "Read")], at(0));
        let stats = store.record_session(
            "s1",
            2_500,
            20_000,
            0.3,
            &[tool("a", "Read"), tool("b", "Grep")],
            at(1_000),
        );

        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_tokens_used, 2_500);
        assert_eq!(stats.total_duration_ms, 20_000);
        assert!((stats.total_cost - 0.3).abs() < 1e-9);
        assert_eq!(stats.tool_usage.get("Read"), Some(&1));
        assert_eq!(stats.tool_usage.get("Grep"), Some(&1));

        let stats = store.record_session("s2", 500, 5_000, 0.05, &[], at(2_000));
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_tokens_used, 3_000);
    }

    #[test]
    fn interleaved_sessions_keep_their_own_contribution() {
        let backend = MemoryBackend::new();
        let store = SessionStatsStore::with_backend(&backend);

        let mut stats = store.load();
        for (step, (id, tool_id)) in [("A", "a1"), ("B", "b1"), ("A", "a1"), ("B", "b1")]
            .into_iter()
            .enumerate()
        {
            stats = store.record_session(id, 1_000, 10_000, 1.0, &[tool(tool_id, "Read")], at(step as i64));
        }

        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_tokens_used, 2_000);
        assert_eq!(stats.total_duration_ms, 20_000);
        assert!((stats.total_cost - 2.0).abs() < 1e-9);
        assert_eq!(stats.tool_usage.get("Read"), Some(&2));
    }

    #[test]
    fn summary_mentions_top_tool() {
        let backend = MemoryBackend::new();
        let store = SessionStatsStore::with_backend(&backend);
        store.update(1_500_000, 3_900_000, 2.0, &[tool("a", "Edit")], at(0));

        let summary = store.summary();

        assert!(summary.contains("Sessions:          1"));
        assert!(summary.contains("1.5M"));
        assert!(summary.contains("1h 5m"));
        assert!(summary.contains("Edit (1 calls, 100.0%)"));
    }

    #[test]
    fn negative_cost_is_ignored() {
        let backend = MemoryBackend::new();
        let store = SessionStatsStore::with_backend(&backend);

        let stats = store.update(0, 0, -4.0, &[], at(0));

        assert_eq!(stats.total_cost, 0.0);
    }
}

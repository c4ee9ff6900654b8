use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::backoff::BackoffGate;
use crate::config::{
    self, COST_CACHE_FILE, DisplayConfig, GIT_CACHE_FILE, HudConfig, KEYCHAIN_BACKOFF_FILE,
    MEMORY_CACHE_FILE, SPEED_CACHE_FILE, STATS_CACHE_FILE, USAGE_CACHE_FILE,
};
use crate::config_counts::{ConfigCounts, count_configs};
use crate::cost::{CostAccumulator, CostStats, TokenUsage, compute_total_cost};
use crate::extra::run_extra_cmd;
use crate::git::{GitCli, GitStatus, GitStatusCache};
use crate::memory::{ProjectMemory, ProjectMemoryStore, SessionMark};
use crate::speed::{SpeedTracker, format_speed};
use crate::stats::SessionStatsStore;
use crate::stdin::{self, StdinSnapshot};
use crate::store::FileBackend;
use crate::transcript::{Retention, TranscriptState, reconstruct_with};
use crate::usage::{HttpUsageEndpoint, SystemCredentials, UsageCache, UsageData};
use crate::util::{
    format_cost, format_session_duration, format_time_until, progress_bar, truncate,
};

const INITIALIZING: &str = "[claude-hud] Initializing...";
const CONTEXT_BAR_WIDTH: usize = 10;
const TARGET_CHARS: usize = 24;
const TODO_CHARS: usize = 40;

/// Everything one render needs, gathered up front.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub snapshot: StdinSnapshot,
    pub transcript: TranscriptState,
    pub git: Option<GitStatus>,
    pub usage: Option<UsageData>,
    pub speed: Option<u64>,
    pub cost: Option<CostStats>,
    pub memory: Option<ProjectMemory>,
    pub configs: ConfigCounts,
    pub extra_label: Option<String>,
    pub now: DateTime<Utc>,
}

impl RenderContext {
    pub fn session_duration(&self) -> Option<Duration> {
        let start = self.transcript.session_start?;
        (self.now - start).to_std().ok()
    }
}

/// Reads the snapshot from stdin and prints one status line.
pub fn run(config: &HudConfig, extra_cmd: Option<&str>) -> Result<()> {
    let Some(snapshot) = stdin::read_stdin() else {
        println!("{INITIALIZING}");
        return Ok(());
    };
    let mut ctx = gather(config, snapshot, Utc::now());
    ctx.extra_label = extra_cmd.and_then(run_extra_cmd);
    println!("{}", render_line(&ctx, &config.display));
    Ok(())
}

pub fn gather(config: &HudConfig, snapshot: StdinSnapshot, now: DateTime<Utc>) -> RenderContext {
    let display = &config.display;
    let cwd = snapshot.cwd.clone().or_else(|| env::current_dir().ok());

    let retention = Retention {
        max_tools: config.cache.retention.max_tools,
        max_agents: config.cache.retention.max_agents,
    };
    let transcript = snapshot
        .transcript_path
        .as_deref()
        .map(|path| reconstruct_with(path, retention, now))
        .unwrap_or_default();

    let git = match cwd.as_deref() {
        Some(dir) if display.show_git => {
            GitStatusCache::open(config::cache_path(GIT_CACHE_FILE), &config.cache.git)
                .status_at(dir, &GitCli, now)
        }
        _ => None,
    };

    let usage = display.show_usage.then(|| fetch_usage(config, now)).flatten();

    let speed = display.show_speed.then(|| {
        SpeedTracker::open(config::cache_path(SPEED_CACHE_FILE), &config.cache.speed)
            .observe(snapshot.output_tokens(), now)
    });

    let session_cost = session_cost(config, &snapshot);
    let session_ms = transcript
        .session_start
        .and_then(|start| (now - start).to_std().ok())
        .map_or(0, |elapsed| elapsed.as_millis() as u64);

    let cost = display.show_cost.then(|| {
        let costs = CostAccumulator::open(config::cache_path(COST_CACHE_FILE));
        match snapshot.session_id.as_deref() {
            Some(id) => costs.record_session_total(id, session_cost, now),
            None => costs.stats(now),
        }
    });

    if let Some(id) = snapshot.session_id.as_deref() {
        let tokens = snapshot.total_input_tokens() + snapshot.output_tokens();
        SessionStatsStore::open(config::cache_path(STATS_CACHE_FILE)).record_session(
            id,
            tokens,
            session_ms,
            session_cost,
            &transcript.tools,
            now,
        );
    }

    let memory = match cwd.as_deref() {
        Some(dir) if display.show_memory => {
            let mark = snapshot.session_id.as_ref().map(|id| SessionMark {
                id: id.clone(),
                duration_ms: session_ms,
            });
            let store =
                ProjectMemoryStore::open(config::cache_path(MEMORY_CACHE_FILE), &config.cache.memory);
            Some(store.update(dir, mark.as_ref(), &transcript.tools, now))
        }
        _ => None,
    };

    let configs = if display.show_config_counts {
        count_configs(cwd.as_deref())
    } else {
        ConfigCounts::default()
    };

    RenderContext {
        snapshot,
        transcript,
        git,
        usage,
        speed: speed.flatten(),
        cost,
        memory,
        configs,
        extra_label: None,
        now,
    }
}

fn fetch_usage(config: &HudConfig, now: DateTime<Utc>) -> Option<UsageData> {
    let gate = BackoffGate::new(
        FileBackend::new(config::cache_path(KEYCHAIN_BACKOFF_FILE)),
        config.cache.api.keychain_backoff(),
    );
    let credentials = SystemCredentials::new(config::credentials_path(), gate);
    UsageCache::open(config::cache_path(USAGE_CACHE_FILE), &config.cache.api).usage_at(
        &credentials,
        &HttpUsageEndpoint::default(),
        now,
    )
}

/// The host's own figure when it reports one, else an estimate from tokens.
fn session_cost(config: &HudConfig, snapshot: &StdinSnapshot) -> f64 {
    if let Some(reported) = snapshot.session_cost_usd() {
        return reported;
    }
    let Some(usage) = snapshot
        .context_window
        .as_ref()
        .and_then(|window| window.current_usage.as_ref())
    else {
        return 0.0;
    };
    let tokens = TokenUsage {
        input_tokens: usage.input_tokens.unwrap_or(0),
        output_tokens: usage.output_tokens.unwrap_or(0),
        cache_creation_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
        cache_read_tokens: usage.cache_read_input_tokens.unwrap_or(0),
    };
    let model = snapshot.model_id().unwrap_or_default();
    let computed = compute_total_cost(model, &tokens, &config.pricing);
    debug!(model, source = ?computed.source, cost = computed.total_cost_usd, "estimated session cost");
    computed.total_cost_usd
}

pub fn render_line(ctx: &RenderContext, display: &DisplayConfig) -> String {
    let mut parts = Vec::new();

    let mut model = format!("[{}]", ctx.snapshot.model_name());
    if let Some(provider) = ctx.snapshot.provider_label() {
        model.push_str(&format!(" {provider}"));
    }
    parts.push(model);

    if let Some(pct) = ctx.snapshot.context_percent() {
        parts.push(format!(
            "{} {pct}%",
            progress_bar(f64::from(pct), CONTEXT_BAR_WIDTH)
        ));
    }

    if display.show_git && let Some(git) = &ctx.git {
        parts.push(git.summary());
    }

    if display.show_config_counts {
        parts.extend(ctx.configs.parts());
    }

    if display.show_usage && let Some(usage) = &ctx.usage {
        parts.push(usage_part(usage, ctx.now));
    }

    if display.show_cost && let Some(cost) = &ctx.cost {
        parts.push(format!(
            "{} (today {})",
            format_cost(cost.session),
            format_cost(cost.today)
        ));
    }

    if display.show_speed && let Some(speed) = ctx.speed {
        parts.push(format_speed(speed));
    }

    if let Some(duration) = ctx.session_duration() {
        parts.push(format_session_duration(duration));
    }

    if display.show_tools && let Some(tools) = tools_part(&ctx.transcript) {
        parts.push(tools);
    }

    if display.show_agents {
        for agent in ctx.transcript.running_agents() {
            let mut text = format!("agent {}", agent.agent_type);
            if let Some(description) = &agent.description {
                text.push_str(&format!(": {}", truncate(description, TARGET_CHARS)));
            }
            parts.push(text);
        }
    }

    if display.show_todos {
        let (done, total) = ctx.transcript.todo_progress();
        if total > 0 {
            let mut text = format!("todos {done}/{total}");
            if let Some(todo) = ctx.transcript.in_progress_todo() {
                text.push_str(&format!(" {}", truncate(&todo.content, TODO_CHARS)));
            }
            parts.push(text);
        }
    }

    if display.show_memory
        && let Some(memory) = &ctx.memory
        && let Some(hot) = memory.most_edited_files(1).first()
    {
        parts.push(format!("hot {} ({} edits)", hot.path, hot.edits));
    }

    if let Some(label) = &ctx.extra_label {
        parts.push(label.clone());
    }

    parts.join(" | ")
}

fn usage_part(usage: &UsageData, now: DateTime<Utc>) -> String {
    if usage.api_unavailable {
        let code = usage.api_error.as_deref().unwrap_or("unknown");
        return format!("{} usage unavailable ({code})", usage.plan_name);
    }
    let mut text = usage.plan_name.clone();
    if let Some(pct) = usage.five_hour {
        text.push_str(&format!(
            " 5h {pct}% ({})",
            format_time_until(usage.five_hour_reset_at, now)
        ));
    }
    if let Some(pct) = usage.seven_day {
        text.push_str(&format!(" 7d {pct}%"));
    }
    text
}

fn tools_part(transcript: &TranscriptState) -> Option<String> {
    let mut pieces: Vec<String> = transcript
        .running_tools()
        .map(|tool| match &tool.target {
            Some(target) => format!("{}: {}", tool.name, truncate(target, TARGET_CHARS)),
            None => tool.name.clone(),
        })
        .collect();
    let finished = transcript.tools.iter().filter(|tool| !tool.is_running()).count();
    if finished > 0 {
        pieces.push(format!("{finished} done"));
    }
    (!pieces.is_empty()).then(|| pieces.join(", "))
}

pub fn print_stats(config: &HudConfig) -> Result<()> {
    let stats = SessionStatsStore::open(config::cache_path(STATS_CACHE_FILE));
    println!("claude-hud stats");
    println!("config: {}", config::config_path().display());
    print!("{}", stats.summary());

    let now = Utc::now();
    let costs = CostAccumulator::open(config::cache_path(COST_CACHE_FILE)).stats(now);
    println!(
        "Cost today/total:  {} / {}",
        format_cost(costs.today),
        format_cost(costs.total)
    );

    println!("caches:");
    for (label, path) in config::cache_files() {
        println!("  {label}: {}", cache_inventory(config, &path, now));
    }
    Ok(())
}

fn cache_inventory(config: &HudConfig, path: &Path, now: DateTime<Utc>) -> String {
    if !path.exists() {
        return "empty".to_string();
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let entries = match file_name.as_str() {
        GIT_CACHE_FILE => GitStatusCache::open(path.to_path_buf(), &config.cache.git)
            .store()
            .keys()
            .len(),
        MEMORY_CACHE_FILE => {
            ProjectMemoryStore::open(path.to_path_buf(), &config.cache.memory)
                .projects()
                .len()
        }
        USAGE_CACHE_FILE => UsageCache::open(path.to_path_buf(), &config.cache.api)
            .store()
            .keys()
            .len(),
        SPEED_CACHE_FILE => SpeedTracker::open(path.to_path_buf(), &config.cache.speed)
            .store()
            .keys()
            .len(),
        STATS_CACHE_FILE => SessionStatsStore::open(path.to_path_buf()).store().keys().len(),
        KEYCHAIN_BACKOFF_FILE => {
            let gate = BackoffGate::new(
                FileBackend::new(path.to_path_buf()),
                config.cache.api.keychain_backoff(),
            );
            let state = if gate.should_attempt_at(now) { "expired" } else { "active" };
            return format!("{} ({state})", path.display());
        }
        _ => return format!("{}", path.display()),
    };
    format!("{} ({entries} entries)", path.display())
}

/// Removes every cache file. Missing files are not an error.
pub fn clear_caches() -> Result<()> {
    let mut removed = 0usize;
    for (label, path) in config::cache_files() {
        if remove_cache_file(&path)
            .with_context(|| format!("failed to remove {label} cache {}", path.display()))?
        {
            println!("removed {label}: {}", path.display());
            removed += 1;
        }
    }
    if removed == 0 {
        println!("no cache files to remove");
    }
    Ok(())
}

fn remove_cache_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cache removal failed");
            Err(err.into())
        }
    }
}

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MemoryCacheConfig;
use crate::store::{CacheBackend, CacheStore, FileBackend, TtlRule};
use crate::transcript::{ToolCall, ToolState};
use crate::util::canonical_key;

pub const MEMORY_CACHE_VERSION: &str = "1.0.0";
const MAX_TIME_RANGES: usize = 168;
const MAX_COUNTED_TOOL_IDS: usize = 200;
const MAX_TRACKED_SESSIONS: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DirectoryActivity {
    pub edits: u64,
    pub reads: u64,
    pub last_active: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveTimeRange {
    pub hour: u32,
    /// 0 = Sunday.
    pub day_of_week: u32,
    pub count: u64,
}

/// Cross-session activity for one project directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProjectMemory {
    pub project_path: String,
    pub last_seen: i64,
    pub file_edits: BTreeMap<String, u64>,
    pub file_reads: BTreeMap<String, u64>,
    pub directory_activity: BTreeMap<String, DirectoryActivity>,
    pub total_sessions: u64,
    pub total_duration_ms: u64,
    pub average_session_duration_ms: u64,
    pub active_time_ranges: Vec<ActiveTimeRange>,
    recent_sessions: Vec<SessionMark>,
    counted_tool_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInsight {
    pub path: String,
    pub edits: u64,
    pub reads: u64,
    pub heat: u64,
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Edit,
}

impl Access {
    fn of(tool_name: &str) -> Option<Self> {
        match tool_name {
            "Read" | "Grep" | "Glob" => Some(Self::Read),
            "Edit" | "Write" | "MultiEdit" => Some(Self::Edit),
            _ => None,
        }
    }
}

impl ProjectMemory {
    fn new(project_path: String) -> Self {
        Self {
            project_path,
            ..Self::default()
        }
    }

    pub fn heat(&self, file: &str) -> u64 {
        let edits = self.file_edits.get(file).copied().unwrap_or(0);
        let reads = self.file_reads.get(file).copied().unwrap_or(0);
        edits * 2 + reads
    }

    /// Edited files, hottest first.
    pub fn most_edited_files(&self, limit: usize) -> Vec<FileInsight> {
        let mut files: Vec<FileInsight> = self
            .file_edits
            .iter()
            .map(|(path, edits)| FileInsight {
                path: path.clone(),
                edits: *edits,
                reads: self.file_reads.get(path).copied().unwrap_or(0),
                heat: self.heat(path),
            })
            .collect();
        files.sort_by(|a, b| b.heat.cmp(&a.heat).then_with(|| a.path.cmp(&b.path)));
        files.truncate(limit);
        files
    }

    pub fn active_directories(&self, limit: usize) -> Vec<String> {
        let mut dirs: Vec<(&String, u64)> = self
            .directory_activity
            .iter()
            .map(|(dir, activity)| (dir, activity.edits + activity.reads))
            .collect();
        dirs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        dirs.into_iter()
            .take(limit)
            .map(|(dir, _)| dir.clone())
            .collect()
    }

    fn track_tools(&mut self, tools: &[ToolCall], now_ms: i64) {
        let mut counted: HashSet<String> = self.counted_tool_ids.iter().cloned().collect();
        for tool in tools {
            if tool.status == ToolState::Running || counted.contains(&tool.id) {
                continue;
            }
            counted.insert(tool.id.clone());
            self.counted_tool_ids.push(tool.id.clone());

            let (Some(access), Some(target)) = (Access::of(&tool.name), tool.target.as_deref())
            else {
                continue;
            };
            let directory = parent_directory(target);
            let activity = self.directory_activity.entry(directory).or_default();
            activity.last_active = now_ms;
            match access {
                Access::Read => {
                    *self.file_reads.entry(target.to_string()).or_default() += 1;
                    activity.reads += 1;
                }
                Access::Edit => {
                    *self.file_edits.entry(target.to_string()).or_default() += 1;
                    activity.edits += 1;
                }
            }
        }

        let excess = self
            .counted_tool_ids
            .len()
            .saturating_sub(MAX_COUNTED_TOOL_IDS);
        self.counted_tool_ids.drain(..excess);
    }

    /// Renders of a recently seen session replace its duration instead of
    /// adding to it, so interleaved sessions are each counted once.
    fn track_session(&mut self, session: &SessionMark) {
        let previous = self
            .recent_sessions
            .iter()
            .position(|seen| seen.id == session.id)
            .map(|index| self.recent_sessions.remove(index));
        match previous {
            Some(previous) => {
                self.total_duration_ms =
                    self.total_duration_ms.saturating_sub(previous.duration_ms) + session.duration_ms;
            }
            None => {
                self.total_sessions += 1;
                self.total_duration_ms += session.duration_ms;
            }
        }
        self.recent_sessions.push(session.clone());
        let excess = self
            .recent_sessions
            .len()
            .saturating_sub(MAX_TRACKED_SESSIONS);
        self.recent_sessions.drain(..excess);

        self.average_session_duration_ms = if self.total_sessions == 0 {
            0
        } else {
            (self.total_duration_ms as f64 / self.total_sessions as f64).round() as u64
        };
    }

    fn track_active_time(&mut self, now: DateTime<Utc>) {
        let local = now.with_timezone(&Local);
        let hour = local.hour();
        let day_of_week = local.weekday().num_days_from_sunday();

        if let Some(range) = self
            .active_time_ranges
            .iter_mut()
            .find(|range| range.hour == hour && range.day_of_week == day_of_week)
        {
            range.count += 1;
            return;
        }
        self.active_time_ranges.push(ActiveTimeRange {
            hour,
            day_of_week,
            count: 1,
        });
        if self.active_time_ranges.len() > MAX_TIME_RANGES {
            self.active_time_ranges.remove(0);
        }
    }

    /// Keeps the `max_files` hottest files.
    fn limit_files(&mut self, max_files: usize) {
        let mut files: Vec<String> = self
            .file_edits
            .keys()
            .chain(self.file_reads.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if files.len() <= max_files {
            return;
        }
        files.sort_by(|a, b| self.heat(b).cmp(&self.heat(a)).then_with(|| a.cmp(b)));
        for file in files.drain(max_files..) {
            self.file_edits.remove(&file);
            self.file_reads.remove(&file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMark {
    pub id: String,
    pub duration_ms: u64,
}

pub struct ProjectMemoryStore<B = FileBackend> {
    store: CacheStore<ProjectMemory, B>,
    max_files: usize,
}

impl ProjectMemoryStore {
    pub fn open(path: PathBuf, config: &MemoryCacheConfig) -> Self {
        Self::with_backend(FileBackend::new(path), config)
    }
}

impl<B: CacheBackend> ProjectMemoryStore<B> {
    pub fn with_backend(backend: B, config: &MemoryCacheConfig) -> Self {
        Self {
            store: CacheStore::new(
                backend,
                MEMORY_CACHE_VERSION,
                TtlRule::Never,
                config.max_projects,
            ),
            max_files: config.max_files_per_project.max(1),
        }
    }

    pub fn get(&self, cwd: &Path) -> Option<ProjectMemory> {
        self.store.get(&canonical_key(cwd))
    }

    pub fn update(
        &self,
        cwd: &Path,
        session: Option<&SessionMark>,
        tools: &[ToolCall],
        now: DateTime<Utc>,
    ) -> ProjectMemory {
        let key = canonical_key(cwd);
        let now_ms = now.timestamp_millis();
        self.store.update_at(&key, now, |current| {
            let mut memory = current.unwrap_or_else(|| ProjectMemory::new(key.clone()));
            memory.last_seen = now_ms;
            memory.track_tools(tools, now_ms);
            if let Some(session) = session.filter(|session| session.duration_ms > 0) {
                memory.track_session(session);
            }
            memory.track_active_time(now);
            memory.limit_files(self.max_files);
            memory
        })
    }

    pub fn projects(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn store(&self) -> &CacheStore<ProjectMemory, B> {
        &self.store
    }
}

fn parent_directory(target: &str) -> String {
    match Path::new(target).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.display().to_string(),
        _ => ".".to_string(),
    }
}

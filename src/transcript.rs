use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::util::truncate;

pub const DEFAULT_MAX_TOOLS: usize = 20;
pub const DEFAULT_MAX_AGENTS: usize = 10;
const COMMAND_TARGET_CHARS: usize = 30;
const UNTITLED_TASK: &str = "Untitled task";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    #[default]
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub target: Option<String>,
    pub status: ToolState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.finished_at? - self.started_at)
    }

    pub fn is_running(&self) -> bool {
        self.status == ToolState::Running
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRun {
    pub id: String,
    pub agent_type: String,
    pub model: Option<String>,
    pub description: Option<String>,
    pub status: AgentState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.finished_at? - self.started_at)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn parse(value: Option<&Value>) -> Option<Self> {
        match value?.as_str()? {
            "pending" | "not_started" => Some(Self::Pending),
            "in_progress" | "running" => Some(Self::InProgress),
            "completed" | "done" | "complete" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TranscriptState {
    pub tools: Vec<ToolCall>,
    pub agents: Vec<AgentRun>,
    pub todos: Vec<TodoItem>,
    pub session_start: Option<DateTime<Utc>>,
}

impl TranscriptState {
    pub fn running_tools(&self) -> impl Iterator<Item = &ToolCall> {
        self.tools.iter().filter(|tool| tool.is_running())
    }

    pub fn running_agents(&self) -> impl Iterator<Item = &AgentRun> {
        self.agents
            .iter()
            .filter(|agent| agent.status == AgentState::Running)
    }

    pub fn todo_progress(&self) -> (usize, usize) {
        let done = self
            .todos
            .iter()
            .filter(|todo| todo.status == TodoStatus::Completed)
            .count();
        (done, self.todos.len())
    }

    pub fn in_progress_todo(&self) -> Option<&TodoItem> {
        self.todos
            .iter()
            .find(|todo| todo.status == TodoStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub max_tools: usize,
    pub max_agents: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_tools: DEFAULT_MAX_TOOLS,
            max_agents: DEFAULT_MAX_AGENTS,
        }
    }
}

/// Bounded, insertion-ordered entries plus an index of the ones still open.
///
/// An id stays in `open` only until its closing event arrives or its entry
/// falls out of the retained window.
#[derive(Debug)]
struct OpenLedger<T> {
    entries: VecDeque<T>,
    open: HashMap<String, u64>,
    first_seq: u64,
    capacity: usize,
}

impl<T> OpenLedger<T> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            open: HashMap::new(),
            first_seq: 0,
            capacity,
        }
    }

    fn open(&mut self, id: String, entry: T) {
        if let Some(seq) = self.open.get(&id).copied()
            && let Some(slot) = self.slot_mut(seq)
        {
            *slot = entry;
            return;
        }

        let seq = self.first_seq + self.entries.len() as u64;
        self.entries.push_back(entry);
        self.open.insert(id, seq);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            let dropped = self.first_seq;
            self.first_seq += 1;
            self.open.retain(|_, seq| *seq != dropped);
        }
    }

    fn close(&mut self, id: &str) -> Option<&mut T> {
        let seq = self.open.remove(id)?;
        self.slot_mut(seq)
    }

    fn slot_mut(&mut self, seq: u64) -> Option<&mut T> {
        let index = seq.checked_sub(self.first_seq)?;
        self.entries.get_mut(usize::try_from(index).ok()?)
    }

    fn into_vec(self) -> Vec<T> {
        self.entries.into()
    }
}

#[derive(Debug, Default)]
struct TodoBoard {
    items: Vec<TodoItem>,
    references: HashMap<String, usize>,
}

impl TodoBoard {
    fn replace_all(&mut self, items: Vec<TodoItem>) {
        self.items = items;
        self.references.clear();
    }

    fn append(&mut self, reference: String, item: TodoItem) {
        self.items.push(item);
        self.references.insert(reference, self.items.len() - 1);
    }

    /// Symbolic reference first, then a 1-based ordinal when the key is
    /// purely numeric.
    fn resolve(&self, reference: &str) -> Option<usize> {
        if let Some(&index) = self.references.get(reference) {
            return (index < self.items.len()).then_some(index);
        }
        if reference.is_empty() || !reference.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let ordinal: usize = reference.parse().ok()?;
        ordinal
            .checked_sub(1)
            .filter(|index| *index < self.items.len())
    }

    fn update(
        &mut self,
        reference: &str,
        status: Option<TodoStatus>,
        content: Option<String>,
    ) -> bool {
        let Some(index) = self.resolve(reference) else {
            return false;
        };
        let item = &mut self.items[index];
        if let Some(status) = status {
            item.status = status;
        }
        if let Some(content) = content {
            item.content = content;
        }
        true
    }
}

/// Folds transcript records, in order, into the current session state.
#[derive(Debug)]
pub struct TranscriptReconstructor {
    now: DateTime<Utc>,
    tools: OpenLedger<ToolCall>,
    agents: OpenLedger<AgentRun>,
    todos: TodoBoard,
    session_start: Option<DateTime<Utc>>,
    skipped_lines: usize,
}

impl TranscriptReconstructor {
    /// `now` stamps records that carry no timestamp of their own.
    pub fn new(retention: Retention, now: DateTime<Utc>) -> Self {
        Self {
            now,
            tools: OpenLedger::new(retention.max_tools),
            agents: OpenLedger::new(retention.max_agents),
            todos: TodoBoard::default(),
            session_start: None,
            skipped_lines: 0,
        }
    }

    pub fn apply_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(record) => self.apply_record(&record),
            Err(_) => self.skipped_lines += 1,
        }
    }

    pub fn apply_record(&mut self, record: &Value) {
        let record_time = str_at(record, &["timestamp"]).and_then(parse_utc_timestamp);
        if self.session_start.is_none() && record_time.is_some() {
            self.session_start = record_time;
        }
        let timestamp = record_time.unwrap_or(self.now);

        let Some(blocks) = record
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_array)
        else {
            return;
        };

        for block in blocks {
            match str_at(block, &["type"]).as_deref() {
                Some("tool_use") => {
                    if let (Some(id), Some(name)) = (str_at(block, &["id"]), str_at(block, &["name"]))
                    {
                        let input = block.get("input").unwrap_or(&Value::Null);
                        self.handle_tool_use(id, &name, input, timestamp);
                    }
                }
                Some("tool_result") => {
                    if let Some(id) = str_at(block, &["tool_use_id"]) {
                        let is_error = block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        self.handle_tool_result(&id, is_error, timestamp);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn finish(self) -> TranscriptState {
        if self.skipped_lines > 0 {
            debug!(skipped = self.skipped_lines, "skipped malformed transcript lines");
        }
        TranscriptState {
            tools: self.tools.into_vec(),
            agents: self.agents.into_vec(),
            todos: self.todos.items,
            session_start: self.session_start,
        }
    }

    fn handle_tool_use(&mut self, id: String, name: &str, input: &Value, timestamp: DateTime<Utc>) {
        match name {
            "Task" | "Agent" => {
                let run = AgentRun {
                    id: id.clone(),
                    agent_type: str_at(input, &["subagent_type"])
                        .unwrap_or_else(|| "unknown".to_string()),
                    model: str_at(input, &["model"]),
                    description: str_at(input, &["description"]),
                    status: AgentState::Running,
                    started_at: timestamp,
                    finished_at: None,
                };
                self.agents.open(id, run);
            }
            "TodoWrite" => {
                if let Some(todos) = input.get("todos").and_then(Value::as_array) {
                    self.todos
                        .replace_all(todos.iter().filter_map(parse_todo_entry).collect());
                }
            }
            "TaskCreate" => {
                let content = task_text(input).unwrap_or_else(|| UNTITLED_TASK.to_string());
                let status = TodoStatus::parse(input.get("status")).unwrap_or_default();
                let reference = input.get("taskId").and_then(reference_key).unwrap_or(id);
                self.todos.append(reference, TodoItem { content, status });
            }
            "TaskUpdate" => {
                let Some(reference) = input.get("taskId").and_then(reference_key) else {
                    return;
                };
                let status = TodoStatus::parse(input.get("status"));
                if !self.todos.update(&reference, status, task_text(input)) {
                    debug!(reference = %reference, "todo update references no known task");
                }
            }
            _ => {
                let call = ToolCall {
                    id: id.clone(),
                    name: name.to_string(),
                    target: extract_target(name, input),
                    status: ToolState::Running,
                    started_at: timestamp,
                    finished_at: None,
                };
                self.tools.open(id, call);
            }
        }
    }

    fn handle_tool_result(&mut self, id: &str, is_error: bool, timestamp: DateTime<Utc>) {
        if let Some(call) = self.tools.close(id) {
            call.status = if is_error {
                ToolState::Error
            } else {
                ToolState::Completed
            };
            call.finished_at = Some(timestamp.max(call.started_at));
            return;
        }
        if let Some(run) = self.agents.close(id) {
            run.status = AgentState::Completed;
            run.finished_at = Some(timestamp.max(run.started_at));
        }
    }
}

pub fn reconstruct(path: &Path) -> TranscriptState {
    reconstruct_with(path, Retention::default(), Utc::now())
}

/// Missing or unreadable transcripts produce whatever state was folded so far.
pub fn reconstruct_with(path: &Path, retention: Retention, now: DateTime<Utc>) -> TranscriptState {
    let mut reconstructor = TranscriptReconstructor::new(retention, now);
    if path.as_os_str().is_empty() {
        return reconstructor.finish();
    }

    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                debug!(path = %path.display(), error = %err, "failed to open transcript");
            }
            return reconstructor.finish();
        }
    };

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => reconstructor.apply_line(&String::from_utf8_lossy(&buf)),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "transcript read interrupted");
                break;
            }
        }
    }
    reconstructor.finish()
}

fn extract_target(name: &str, input: &Value) -> Option<String> {
    match name {
        "Read" | "Write" | "Edit" | "MultiEdit" => {
            str_at(input, &["file_path"]).or_else(|| str_at(input, &["path"]))
        }
        "NotebookEdit" => str_at(input, &["notebook_path"]),
        "Glob" | "Grep" => str_at(input, &["pattern"]),
        "Bash" => {
            let command = str_at(input, &["command"])?;
            (!command.is_empty()).then(|| truncate(&command, COMMAND_TARGET_CHARS))
        }
        "WebFetch" => str_at(input, &["url"]),
        "WebSearch" => str_at(input, &["query"]),
        _ => None,
    }
}

fn parse_todo_entry(value: &Value) -> Option<TodoItem> {
    if !value.is_object() {
        return None;
    }
    let content = str_at(value, &["content"])
        .or_else(|| str_at(value, &["text"]))
        .or_else(|| str_at(value, &["subject"]))
        .unwrap_or_default();
    let status = TodoStatus::parse(value.get("status")).unwrap_or_default();
    Some(TodoItem { content, status })
}

fn task_text(input: &Value) -> Option<String> {
    str_at(input, &["subject"])
        .filter(|text| !text.is_empty())
        .or_else(|| str_at(input, &["description"]).filter(|text| !text.is_empty()))
}

fn reference_key(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn parse_utc_timestamp(text: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor.as_str().map(|s| s.to_string())
}

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::config;

const CLAUDE_MD_FILES: [&str; 4] = [
    "CLAUDE.md",
    "CLAUDE.local.md",
    ".claude/CLAUDE.md",
    ".claude/CLAUDE.local.md",
];

/// How much user and project configuration is loaded into the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigCounts {
    pub claude_md: usize,
    pub rules: usize,
    pub mcp_servers: usize,
    pub hooks: usize,
}

impl ConfigCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// One piece per non-zero count, e.g. `["2 CLAUDE.md", "3 MCPs"]`.
    pub fn parts(&self) -> Vec<String> {
        [
            (self.claude_md, "CLAUDE.md"),
            (self.rules, "rules"),
            (self.mcp_servers, "MCPs"),
            (self.hooks, "hooks"),
        ]
        .into_iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{count} {label}"))
        .collect()
    }
}

/// Counts against the real Claude home and `~/.claude.json`.
pub fn count_configs(cwd: Option<&Path>) -> ConfigCounts {
    count_configs_in(&config::claude_home(), &config::claude_json_path(), cwd)
}

/// Unreadable or malformed files count as empty.
pub fn count_configs_in(claude_home: &Path, claude_json: &Path, cwd: Option<&Path>) -> ConfigCounts {
    let mut counts = ConfigCounts::default();

    if claude_home.join("CLAUDE.md").is_file() {
        counts.claude_md += 1;
    }
    counts.rules += count_rules(&claude_home.join("rules"));

    let user_settings = read_json(&claude_home.join("settings.json"));
    let user_json = read_json(claude_json);
    let mut user_servers = server_names(user_settings.as_ref());
    user_servers.extend(server_names(user_json.as_ref()));
    for name in string_list(user_json.as_ref(), "disabledMcpServers") {
        user_servers.remove(&name);
    }
    counts.hooks += hook_count(user_settings.as_ref());

    let mut project_servers = BTreeSet::new();
    if let Some(cwd) = cwd {
        counts.claude_md += CLAUDE_MD_FILES
            .iter()
            .filter(|file| cwd.join(file).is_file())
            .count();
        counts.rules += count_rules(&cwd.join(".claude").join("rules"));

        let local_settings = read_json(&cwd.join(".claude").join("settings.local.json"));
        let project_settings = read_json(&cwd.join(".claude").join("settings.json"));

        project_servers = server_names(read_json(&cwd.join(".mcp.json")).as_ref());
        for name in string_list(local_settings.as_ref(), "disabledMcpjsonServers") {
            project_servers.remove(&name);
        }
        project_servers.extend(server_names(project_settings.as_ref()));

        counts.hooks += hook_count(project_settings.as_ref());
        counts.hooks += hook_count(local_settings.as_ref());
    }

    // a server configured at both levels counts once per level
    counts.mcp_servers = user_servers.len() + project_servers.len();
    counts
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "skipping malformed settings file");
            None
        }
    }
}

fn server_names(settings: Option<&Value>) -> BTreeSet<String> {
    settings
        .and_then(|value| value.get("mcpServers"))
        .and_then(Value::as_object)
        .map(|servers| servers.keys().cloned().collect())
        .unwrap_or_default()
}

fn string_list(settings: Option<&Value>, key: &str) -> Vec<String> {
    settings
        .and_then(|value| value.get(key))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn hook_count(settings: Option<&Value>) -> usize {
    settings
        .and_then(|value| value.get("hooks"))
        .and_then(Value::as_object)
        .map_or(0, |hooks| hooks.len())
}

/// `.md` files anywhere below `dir`.
fn count_rules(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("md"))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create dirs");
        }
        fs::write(path, contents).expect("write file");
    }

    struct Layout {
        _tmp: TempDir,
        home: PathBuf,
        claude_json: PathBuf,
        project: PathBuf,
    }

    fn layout() -> Layout {
        let tmp = TempDir::new().expect("temp dir");
        let home = tmp.path().join(".claude");
        let claude_json = tmp.path().join(".claude.json");
        let project = tmp.path().join("project");
        fs::create_dir_all(&home).expect("claude home");
        fs::create_dir_all(&project).expect("project dir");
        Layout {
            _tmp: tmp,
            home,
            claude_json,
            project,
        }
    }

    #[test]
    fn empty_directories_count_nothing() {
        let dirs = layout();
        let counts = count_configs_in(&dirs.home, &dirs.claude_json, Some(&dirs.project));
        assert!(counts.is_empty());
        assert!(counts.parts().is_empty());
    }

    #[test]
    fn counts_user_and_project_files() {
        let dirs = layout();
        write(&dirs.home.join("CLAUDE.md"), "user");
        write(&dirs.home.join("rules/style.md"), "");
        write(&dirs.home.join("rules/nested/deep.md"), "");
        write(&dirs.home.join("rules/notes.txt"), "");
        write(&dirs.project.join("CLAUDE.md"), "");
        write(&dirs.project.join(".claude/CLAUDE.local.md"), "");
        write(&dirs.project.join(".claude/rules/testing.md"), "");

        let counts = count_configs_in(&dirs.home, &dirs.claude_json, Some(&dirs.project));

        assert_eq!(counts.claude_md, 3);
        assert_eq!(counts.rules, 3);
    }

    #[test]
    fn disabled_mcp_servers_are_filtered_per_level() {
        let dirs = layout();
        write(
            &dirs.home.join("settings.json"),
            r#"{"mcpServers":{"github":{},"linear":{}},"hooks":{"PreToolUse":[],"Stop":[]}}"#,
        );
        write(
            &dirs.claude_json,
            r#"{"mcpServers":{"github":{},"slack":{}},"disabledMcpServers":["linear",7]}"#,
        );
        write(
            &dirs.project.join(".mcp.json"),
            r#"{"mcpServers":{"db":{},"browser":{}}}"#,
        );
        write(
            &dirs.project.join(".claude/settings.local.json"),
            r#"{"disabledMcpjsonServers":["browser"],"hooks":{"Notification":[]}}"#,
        );
        write(
            &dirs.project.join(".claude/settings.json"),
            r#"{"mcpServers":{"github":{}},"hooks":{"PostToolUse":[]}}"#,
        );

        let counts = count_configs_in(&dirs.home, &dirs.claude_json, Some(&dirs.project));

        // user: github, slack; project: db, github
        assert_eq!(counts.mcp_servers, 4);
        assert_eq!(counts.hooks, 4);
    }

    #[test]
    fn project_files_need_a_cwd_and_bad_json_is_skipped() {
        let dirs = layout();
        write(&dirs.home.join("settings.json"), "{not json");
        write(&dirs.project.join("CLAUDE.md"), "");

        let counts = count_configs_in(&dirs.home, &dirs.claude_json, None);

        assert!(counts.is_empty());
    }

    #[test]
    fn parts_skip_zero_counts() {
        let counts = ConfigCounts {
            claude_md: 2,
            rules: 0,
            mcp_servers: 3,
            hooks: 1,
        };
        assert_eq!(counts.parts(), vec!["2 CLAUDE.md", "3 MCPs", "1 hooks"]);
    }
}

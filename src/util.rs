use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing_subscriber::{EnvFilter, fmt};

/// Logs go to stderr; stdout carries the status line.
pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .without_time()
        .try_init();
}

/// Tries each provider in order and returns the first value produced.
pub fn first_present<T>(providers: &[&dyn Fn() -> Option<T>]) -> Option<T> {
    providers.iter().find_map(|provider| provider())
}

/// Stable cache key for a directory: its canonical path when it exists.
pub fn canonical_key(dir: &Path) -> String {
    fs::canonicalize(dir)
        .unwrap_or_else(|_| dir.to_path_buf())
        .display()
        .to_string()
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_cost(cost_usd: f64) -> String {
    if !cost_usd.is_finite() || cost_usd <= 0.0 {
        return "$0.00".to_string();
    }
    if cost_usd < 0.01 {
        format!("${cost_usd:.4}")
    } else if cost_usd < 1.0 {
        format!("${cost_usd:.3}")
    } else {
        format!("${cost_usd:.2}")
    }
}

pub fn format_time_until(target: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(target) = target else {
        return "n/a".to_string();
    };
    if target <= now {
        return "now".to_string();
    }

    let delta = (target - now).to_std().unwrap_or_default();
    human_duration(delta)
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Session length at minute resolution: `<1m`, `45m`, `2h 5m`.
pub fn format_session_duration(duration: Duration) -> String {
    let minutes = duration.as_secs() / 60;
    if minutes == 0 {
        return "<1m".to_string();
    }
    let hours = minutes / 60;
    if hours > 0 {
        format!("{hours}h {}m", minutes % 60)
    } else {
        format!("{minutes}m")
    }
}

pub fn progress_bar(percent: f64, width: usize) -> String {
    let pct = percent.clamp(0.0, 100.0);
    let filled = ((pct / 100.0) * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("{}{}", "#".repeat(filled), "-".repeat(empty))
}

/// Keeps the first `max_chars` characters and marks the cut with `...`.
pub fn truncate(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &input[..cut]),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn token_formatting() {
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(1_500_000), "1.5M");
    }

    #[test]
    fn cost_formatting() {
        assert_eq!(format_cost(0.0), "$0.00");
        assert_eq!(format_cost(0.0009), "$0.0009");
        assert_eq!(format_cost(0.1284), "$0.128");
        assert_eq!(format_cost(12.3456), "$12.35");
    }

    #[test]
    fn session_duration_formatting() {
        assert_eq!(format_session_duration(Duration::from_secs(59)), "<1m");
        assert_eq!(format_session_duration(Duration::from_secs(45 * 60)), "45m");
        assert_eq!(
            format_session_duration(Duration::from_secs(2 * 3_600 + 5 * 60)),
            "2h 5m"
        );
    }

    #[test]
    fn time_until_formatting() {
        let now = DateTime::<Utc>::from_timestamp(1_000_000, 0).expect("timestamp");
        assert_eq!(format_time_until(None, now), "n/a");
        assert_eq!(format_time_until(Some(now), now), "now");
        assert_eq!(
            format_time_until(Some(now + TimeDelta::minutes(90)), now),
            "1h 30m"
        );
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly10!", 10), "exactly10!");
        assert_eq!(truncate("grüße aus köln", 5), "grüße...");
    }

    #[test]
    fn first_present_stops_at_first_value() {
        let calls = std::cell::Cell::new(0);
        let none = || -> Option<i32> {
            calls.set(calls.get() + 1);
            None
        };
        let some = || Some(7);
        let never = || -> Option<i32> { unreachable!("not reached") };
        let providers: [&dyn Fn() -> Option<i32>; 3] = [&none, &some, &never];
        assert_eq!(first_present(&providers), Some(7));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn progress_bar_clamps() {
        assert_eq!(progress_bar(50.0, 10), "#####-----");
        assert_eq!(progress_bar(150.0, 4), "####");
    }
}

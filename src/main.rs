use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use claude_hud::app;
use claude_hud::cli::{Cli, Commands};
use claude_hud::config::HudConfig;
use claude_hud::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("claude-hud error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Stats) => {
            let config = HudConfig::load()?;
            app::print_stats(&config)?;
            Ok(0)
        }
        Some(Commands::ClearCache) => {
            app::clear_caches()?;
            Ok(0)
        }
        None => {
            // the status line always renders, even with a broken config
            let config = HudConfig::load().unwrap_or_else(|err| {
                warn!(error = %format!("{err:#}"), "using default config");
                HudConfig::default()
            });
            app::run(&config, cli.extra_cmd.as_deref())?;
            Ok(0)
        }
    }
}

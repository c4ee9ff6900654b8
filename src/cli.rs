use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "claude-hud",
    version,
    about = "Status line for Claude Code: reads the session snapshot from stdin and prints one line"
)]
pub struct Cli {
    /// Shell command printing `{"label": "..."}` to append to the line.
    #[arg(long, value_name = "COMMAND")]
    pub extra_cmd: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print historical session statistics and the cache inventory.
    Stats,
    /// Remove every cache file, including the credential backoff marker.
    ClearCache,
}

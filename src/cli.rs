use clap::Parser;
use serde::Serialize;

fn is_false(b: &bool) -> bool {
    !b
}

#[derive(Debug, Default, Parser, Serialize)]
pub struct Cli {
    /// Players (username or uuid) to fetch and rank right after startup
    #[arg(long = "player")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub players: Vec<String>,
    /// Run the startup fetches and exit instead of starting the background jobs
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    pub once: bool,
}

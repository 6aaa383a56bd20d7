//! CLI command definitions and dispatch.

pub mod attach;
pub mod check;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use capgate_common::config::HostConfig;
use capgate_gateway::GatewayConfiguration;

/// capgate: capability gateways for containers.
#[derive(Parser, Debug)]
#[command(name = "capgate", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Host configuration file (JSON). Defaults apply when omitted.
    #[arg(long, global = true, env = "CAPGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse and configure gateways without touching the host.
    Check(check::CheckArgs),
    /// Activate gateways for a running process until Ctrl+C.
    Attach(attach::AttachArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let host = load_host_config(cli.config.as_deref())?;
    match cli.command {
        Command::Check(args) => check::execute(&args, host),
        Command::Attach(args) => attach::execute(&args, host),
    }
}

fn load_host_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    match path {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("loading host configuration {}", path.display())),
        None => Ok(HostConfig::default()),
    }
}

/// Reads and merges gateway configuration documents in the given order.
fn load_gateways(paths: &[PathBuf]) -> anyhow::Result<GatewayConfiguration> {
    if paths.is_empty() {
        anyhow::bail!("no gateway configuration given, use --gateways <file>");
    }
    let mut config = GatewayConfiguration::new();
    for path in paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let document = GatewayConfiguration::from_json(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.merge(document);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_are_merged_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");
        std::fs::write(&first, r#"{ "env": [ { "name": "A", "value": "1" } ] }"#).unwrap();
        std::fs::write(&second, r#"{ "env": [ { "name": "B", "value": "2" } ] }"#).unwrap();

        let config = load_gateways(&[first, second]).unwrap();
        let names: Vec<_> = config.elements("env").iter().map(|e| &e["name"]).collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn missing_documents_are_reported() {
        assert!(load_gateways(&[]).is_err());
        assert!(load_gateways(&[PathBuf::from("/nonexistent/gateways.json")]).is_err());
    }

    #[test]
    fn cli_parses_attach() {
        let cli = Cli::try_parse_from([
            "capgate", "attach", "--pid", "42", "--rootfs", "/tmp/root", "--gateways", "g.json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Attach(ref a) if a.pid == 42));
    }
}

//! Binary entry-point argument parsing (§6). The interactive CLI front-end
//! itself — profile switching UX, `scooter` shell commands — is an
//! out-of-scope external collaborator (§1); all this parses is where the
//! daemon should look for `profiles.yaml`/`settings.yaml`/the registry.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "scooter-gatewayd", version, about = "Local MCP gateway daemon")]
pub struct Cli {
    /// Directory holding profiles.yaml, settings.yaml, and registry/.
    /// Defaults to $SCOOTER_CONFIG_DIR, falling back to ~/.mcp-scooter.
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
}

impl Cli {
    pub fn resolved_config_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.config_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::config::config_dir(),
        }
    }
}

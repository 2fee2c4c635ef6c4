//! Profile command - call a module repeatedly and report where calls land.

use anyhow::{Context, Result};
use clap::Args;
use qvm_core::VmConfig;

use super::GameArgs;
use crate::host::ConsoleHost;

#[derive(Args)]
pub struct ProfileCommand {
    /// Module name
    pub module: String,

    /// Selector for every call
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    pub selector: i32,

    /// Number of calls
    #[arg(short = 'n', long, default_value_t = 1)]
    pub repeat: u32,

    /// Integer arguments after the selector
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<i32>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub game: GameArgs,
}

impl ProfileCommand {
    pub fn run(&self, config: VmConfig) -> Result<()> {
        let config = VmConfig {
            profile: true,
            ..config
        };
        let mode = self.game.mode_for(&config, &self.module);
        let mut registry = self.game.registry(config);
        let handle = registry
            .create(&self.module, ConsoleHost::new(), mode)?
            .with_context(|| format!("no image found for module {}", self.module))?;

        for _ in 0..self.repeat {
            registry.call(handle, self.selector, &self.args)?;
        }

        let report = registry
            .profile_report_for(handle)?
            .context("module is not profiled (native modules never are)")?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        } else {
            print!("{report}");
        }
        Ok(())
    }
}

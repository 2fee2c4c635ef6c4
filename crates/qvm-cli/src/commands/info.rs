//! Info command - load modules and show what the registry holds.

use anyhow::Result;
use clap::Args;
use qvm_core::VmConfig;

use super::GameArgs;
use crate::host::ConsoleHost;

#[derive(Args)]
pub struct InfoCommand {
    /// Modules to load
    #[arg(required = true)]
    pub modules: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub game: GameArgs,
}

impl InfoCommand {
    pub fn run(&self, config: VmConfig) -> Result<()> {
        let modes: Vec<_> = self
            .modules
            .iter()
            .map(|name| self.game.mode_for(&config, name))
            .collect();
        let mut registry = self.game.registry(config);
        let host = ConsoleHost::new();

        for (name, mode) in self.modules.iter().zip(modes) {
            if registry.create(name, host.clone(), mode)?.is_none() {
                eprintln!("{name}: no image found");
            }
        }

        let info = registry.info_report();
        if self.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
        } else {
            print!("{info}");
        }
        Ok(())
    }
}

//! Run command - load a module and call into it.

use anyhow::{Context, Result};
use clap::Args;
use qvm_core::VmConfig;

use super::GameArgs;
use crate::host::ConsoleHost;

#[derive(Args)]
pub struct RunCommand {
    /// Module name, e.g. `qagame` for vm/qagame.qvm
    pub module: String,

    /// Selector passed as the first vmMain argument
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    pub selector: i32,

    /// Integer arguments after the selector (at most ten are passed)
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<i32>,

    /// Print the call profile after the call
    #[arg(long)]
    pub profile: bool,

    #[command(flatten)]
    pub game: GameArgs,
}

impl RunCommand {
    pub fn run(&self, config: VmConfig) -> Result<()> {
        let config = VmConfig {
            profile: config.profile || self.profile,
            ..config
        };
        let mode = self.game.mode_for(&config, &self.module);
        let mut registry = self.game.registry(config);

        let handle = registry
            .create(&self.module, ConsoleHost::new(), mode)?
            .with_context(|| format!("no image found for module {}", self.module))?;

        let result = match registry.call(handle, self.selector, &self.args) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(severity = ?err.severity(), "{err}");
                registry.recover(&err);
                return Err(err.into());
            }
        };
        println!("{result}");

        if self.profile {
            if let Some(report) = registry.profile_report() {
                print!("{report}");
            }
        }
        registry.clear_all()?;
        Ok(())
    }
}

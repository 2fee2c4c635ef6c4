//! Subcommands.

pub mod disasm;
pub mod info;
pub mod profile;
pub mod run;

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use qvm_core::{DirectorySource, ExecutionMode, ModuleRegistry, VmConfig};

/// Execution mode as a command-line value.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Native,
    Compiled,
    Interpreted,
}

impl From<ModeArg> for ExecutionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Native => ExecutionMode::Native,
            ModeArg::Compiled => ExecutionMode::Compiled,
            ModeArg::Interpreted => ExecutionMode::Interpreted,
        }
    }
}

/// Where modules are found; overrides the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct GameArgs {
    /// Base installation directory
    #[arg(long, value_name = "DIR")]
    pub base_path: Option<PathBuf>,

    /// Per-user directory searched before the base directory
    #[arg(long, value_name = "DIR")]
    pub home_path: Option<PathBuf>,

    /// Game directory under the base and home paths
    #[arg(long)]
    pub game: Option<String>,

    /// Execution mode for every module, instead of the configured ones
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,
}

impl GameArgs {
    /// Apply the overrides to `config`.
    pub fn apply(&self, mut config: VmConfig) -> VmConfig {
        if let Some(base) = &self.base_path {
            config.base_path = base.clone();
        }
        if let Some(home) = &self.home_path {
            config.home_path = Some(home.clone());
        }
        if let Some(game) = &self.game {
            config.game = game.clone();
        }
        config
    }

    /// Mode for `name`: the override, else the configured one.
    pub fn mode_for(&self, config: &VmConfig, name: &str) -> ExecutionMode {
        self.mode
            .map_or_else(|| config.mode_for(name), ExecutionMode::from)
    }

    /// Registry reading from the configured game directories.
    pub fn registry(&self, config: VmConfig) -> ModuleRegistry {
        let config = self.apply(config);
        let source = DirectorySource::new(config.search_dirs());
        ModuleRegistry::new(config, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = GameArgs {
            base_path: Some(PathBuf::from("/opt/quake3")),
            game: Some("demoq3".to_string()),
            mode: Some(ModeArg::Interpreted),
            ..GameArgs::default()
        };
        let config = args.apply(VmConfig::default());
        assert_eq!(config.base_path, PathBuf::from("/opt/quake3"));
        assert_eq!(config.game, "demoq3");
        assert_eq!(args.mode_for(&config, "ui"), ExecutionMode::Interpreted);
        assert_eq!(
            GameArgs::default().mode_for(&config, "ui"),
            ExecutionMode::Compiled
        );
    }
}

//! Registry configuration (`qvm.toml`).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

/// How a module's code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Host-native shared library
    Native,
    /// Bytecode translated to machine code at load
    Compiled,
    /// Bytecode interpreter
    Interpreted,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::Compiled => "compiled",
            Self::Interpreted => "interpreted",
        })
    }
}

/// Registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// Installation directory holding game directories
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Per-user directory searched before `base_path`
    #[serde(default)]
    pub home_path: Option<PathBuf>,

    /// Game directory name under each search root
    #[serde(default = "default_game")]
    pub game: String,

    /// Demote load progress messages to debug level
    #[serde(default)]
    pub quiet: bool,

    /// Per-call tracing verbosity (0 = off)
    #[serde(default)]
    pub debug_level: u32,

    /// Count procedure calls for profile reports
    #[serde(default)]
    pub profile: bool,

    /// Allow the compiled backend
    #[serde(default = "default_true")]
    pub jit: bool,

    /// Requested execution mode per module name
    #[serde(default)]
    pub modes: FxHashMap<String, ExecutionMode>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            home_path: None,
            game: default_game(),
            quiet: false,
            debug_level: 0,
            profile: false,
            jit: true,
            modes: FxHashMap::default(),
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_game() -> String {
    "baseq3".to_string()
}

fn default_true() -> bool {
    true
}

static JIT_DISABLED: OnceLock<bool> = OnceLock::new();

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

/// Whether `QVM_DISABLE_JIT` forces the interpreter.
pub fn is_jit_disabled_by_env() -> bool {
    *JIT_DISABLED.get_or_init(|| {
        std::env::var("QVM_DISABLE_JIT")
            .ok()
            .is_some_and(|v| parse_env_truthy(&v))
    })
}

impl VmConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Requested mode for `name` (case-insensitive), defaulting to compiled.
    pub fn mode_for(&self, name: &str) -> ExecutionMode {
        self.modes
            .iter()
            .find(|(module, _)| module.eq_ignore_ascii_case(name))
            .map_or(ExecutionMode::Compiled, |(_, mode)| *mode)
    }

    /// Whether the compiled backend may be used.
    pub fn jit_enabled(&self) -> bool {
        self.jit && !is_jit_disabled_by_env()
    }

    /// Directories searched for images and native libraries, in order.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::with_capacity(2);
        if let Some(home) = &self.home_path {
            dirs.push(home.join(&self.game));
        }
        let base = self.base_path.join(&self.game);
        if !dirs.contains(&base) {
            dirs.push(base);
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert!(config.jit);
        assert!(!config.profile);
        assert_eq!(config.game, "baseq3");
        assert_eq!(config.mode_for("qagame"), ExecutionMode::Compiled);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
base_path = "/opt/game"
home_path = "/home/player/.q3a"
game = "mymod"
profile = true
jit = false

[modes]
qagame = "native"
ui = "interpreted"
"#;
        let config = VmConfig::from_toml(toml).unwrap();
        assert!(config.profile);
        assert!(!config.jit);
        assert_eq!(config.mode_for("QAGAME"), ExecutionMode::Native);
        assert_eq!(config.mode_for("ui"), ExecutionMode::Interpreted);
        assert_eq!(config.mode_for("cgame"), ExecutionMode::Compiled);
        assert_eq!(
            config.search_dirs(),
            vec![
                PathBuf::from("/home/player/.q3a/mymod"),
                PathBuf::from("/opt/game/mymod")
            ]
        );
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(VmConfig::from_toml("[modes]\nqagame = \"turbo\"\n").is_err());
    }

    #[test]
    fn test_env_truthy() {
        assert!(parse_env_truthy("1"));
        assert!(parse_env_truthy("yes"));
        assert!(!parse_env_truthy("0"));
        assert!(!parse_env_truthy(" off "));
        assert!(!parse_env_truthy(""));
    }
}

//! Configuration.
//!
//! One TOML file describes every network instance:
//!
//! ```toml
//! modules-dir = "modules"
//!
//! [instance.liberachat]
//! nick = "cinder"
//! pattern = "!"
//! host = "irc.libera.chat"
//! port = 6697
//! ssl = true
//! database = "liberachat.db"
//!
//! [instance.liberachat.channels."#cinder"]
//! modules = ["family", "access"]
//!
//! [instance.liberachat.channels."#cinder".config.family]
//! greeting = "hello"
//! ```
//!
//! `modules = "*"` enables every shared object in the modules directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Directory holding loadable modules.
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Network instances, keyed by name.
    #[serde(default)]
    pub instance: BTreeMap<String, InstanceConfig>,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

/// One network instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    /// Nickname to register.
    pub nick: String,
    /// Command prefix pattern, e.g. `!`.
    pub pattern: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// NickServ secret, if the nick is registered.
    #[serde(default)]
    pub auth: Option<String>,
    /// Path of this instance's database file.
    pub database: PathBuf,
    /// Whether to wrap the connection in TLS.
    #[serde(default)]
    pub ssl: bool,
    /// PEM trust anchors for TLS; platform roots when absent.
    #[serde(default)]
    pub trust: Option<PathBuf>,
    /// Channels to join, keyed by channel name.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// Per-channel settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelConfig {
    /// Modules enabled on this channel.
    #[serde(default)]
    pub modules: ModuleSelection,

    /// Per-module key/value configuration.
    #[serde(default)]
    pub config: BTreeMap<String, BTreeMap<String, String>>,
}

/// Either an explicit module list or `"*"` for everything available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSelection {
    /// Every module in the modules directory.
    All,
    /// The named modules only.
    Named(Vec<String>),
}

impl Default for ModuleSelection {
    fn default() -> Self {
        Self::Named(Vec::new())
    }
}

impl<'de> Deserialize<'de> for ModuleSelection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Star(String),
            List(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Star(s) if s == "*" => Ok(Self::All),
            Repr::Star(s) => Err(serde::de::Error::custom(format!(
                "expected \"*\" or a list of module names, got {s:?}"
            ))),
            Repr::List(names) => Ok(Self::Named(names)),
        }
    }
}

impl ModuleSelection {
    /// Resolve to concrete module names; `All` scans `modules_dir` for
    /// shared objects.
    pub fn resolve(&self, modules_dir: &Path) -> std::io::Result<Vec<String>> {
        match self {
            Self::Named(names) => Ok(names.clone()),
            Self::All => {
                let mut names = Vec::new();
                for entry in std::fs::read_dir(modules_dir)? {
                    let path = entry?.path();
                    if path.extension().map_or(false, |e| e == "so") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            names.push(stem.to_string());
                        }
                    }
                }
                names.sort();
                Ok(names)
            }
        }
    }
}

impl Config {
    /// Load and parse the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
modules-dir = "mods"

[instance.example]
nick = "bot"
pattern = "!"
host = "irc.example.net"
port = 6667
database = "example.db"

[instance.example.channels."#test"]
modules = ["family", "access"]

[instance.example.channels."#test".config.family]
greeting = "hi"

[instance.secure]
nick = "bot"
pattern = "."
host = "irc.secure.net"
port = 6697
ssl = true
auth = "hunter2"
database = "secure.db"

[instance.secure.channels."#all"]
modules = "*"
"##;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.modules_dir, PathBuf::from("mods"));
        assert_eq!(config.instance.len(), 2);

        let example = &config.instance["example"];
        assert_eq!(example.nick, "bot");
        assert_eq!(example.port, 6667);
        assert!(!example.ssl);
        assert!(example.auth.is_none());

        let chan = &example.channels["#test"];
        assert_eq!(
            chan.modules,
            ModuleSelection::Named(vec!["family".into(), "access".into()])
        );
        assert_eq!(chan.config["family"]["greeting"], "hi");

        let secure = &config.instance["secure"];
        assert!(secure.ssl);
        assert_eq!(secure.auth.as_deref(), Some("hunter2"));
        assert_eq!(secure.channels["#all"].modules, ModuleSelection::All);
    }

    #[test]
    fn test_bad_selection_rejected() {
        let bad = r##"
[instance.x]
nick = "bot"
pattern = "!"
host = "h"
port = 1
database = "x.db"

[instance.x.channels."#c"]
modules = "everything"
"##;
        assert!(toml::from_str::<Config>(bad).is_err());
    }

    #[test]
    fn test_resolve_all_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("family.so"), b"").unwrap();
        std::fs::write(dir.path().join("calc.so"), b"").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"").unwrap();

        let names = ModuleSelection::All.resolve(dir.path()).unwrap();
        assert_eq!(names, vec!["calc", "family"]);
    }

    #[test]
    fn test_resolve_named_passthrough() {
        let names = ModuleSelection::Named(vec!["a".into()])
            .resolve(Path::new("/nonexistent"))
            .unwrap();
        assert_eq!(names, vec!["a"]);
    }
}

//! Error types for the bot.
//!
//! Each subsystem reports through its own enum; the top-level [`Error`]
//! aggregates them for the binary boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level errors surfaced to the binary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O error outside any more specific domain.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Plugin loading failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors encountered when parsing an inbound wire line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Line was empty after cleaning.
    #[error("empty line")]
    EmptyLine,

    /// No command token after the optional prefix.
    #[error("missing command")]
    MissingCommand,
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file did not parse as TOML.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A module selection entry was invalid.
    #[error("invalid module selection: {0:?}")]
    ModuleSelection(String),
}

/// Persistent-store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A query expected a row and found none.
    #[error("no row")]
    NoRow,

    /// An extraction mapping character was not `s` or `i`.
    #[error("invalid extraction mapping character: {0:?}")]
    BadMapping(char),
}

/// Plugin loading and management errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// A dynamic symbol failed the whitelist check.
    #[error("{}", blacklist_reason(.symbol, .libc))]
    Blacklisted {
        /// The offending symbol name.
        symbol: String,
        /// Whether the symbol is of libc origin.
        libc: bool,
    },

    /// The shared object could not be read or was not valid ELF.
    #[error("failed to inspect {path}: {reason}")]
    Inspect {
        /// Path of the shared object.
        path: PathBuf,
        /// Human-readable failure description.
        reason: String,
    },

    /// The dynamic loader rejected the shared object.
    #[error("failed to open {path}: {reason}")]
    Open {
        /// Path of the shared object.
        path: PathBuf,
        /// Loader error text.
        reason: String,
    },

    /// A required entrypoint was missing.
    #[error("missing required symbol {symbol} in {path}")]
    MissingSymbol {
        /// The symbol that could not be resolved.
        symbol: &'static str,
        /// Path of the shared object.
        path: PathBuf,
    },

    /// Module name contained path traversal.
    #[error("invalid module name: {0:?}")]
    BadName(String),

    /// The module is already loaded.
    #[error("module {0} already loaded")]
    AlreadyLoaded(String),

    /// No module with the given name is loaded.
    #[error("no module named {0}")]
    NotFound(String),

    /// The whitelist lookup itself failed.
    #[error("whitelist lookup failed: {0}")]
    Whitelist(#[from] StoreError),
}

fn blacklist_reason(symbol: &str, libc: &bool) -> String {
    if *libc {
        format!("{symbol} from libc is blacklisted")
    } else {
        format!("{symbol} blacklisted")
    }
}

/// Transport-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Name resolution produced no usable address.
    #[error("failed to resolve {host}:{port}")]
    Resolve {
        /// Host that failed to resolve.
        host: String,
        /// Port requested.
        port: u16,
    },

    /// Every resolved address refused the connection.
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        /// Host we attempted.
        host: String,
        /// Port we attempted.
        port: u16,
        /// Error from the last address tried.
        #[source]
        source: std::io::Error,
    },

    /// TLS setup or handshake failure.
    #[error("tls failure for {host}: {source}")]
    Tls {
        /// Host whose certificate failed.
        host: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The server name was not valid for TLS verification.
    #[error("invalid server name {host:?}")]
    ServerName {
        /// The rejected name.
        host: String,
    },

    /// Restart capture was requested on a TLS transport.
    #[error("tls transports cannot capture a restart hint")]
    CaptureTls,

    /// I/O error while reinstating a captured descriptor.
    #[error("failed to reinstate captured descriptor: {0}")]
    Reinstate(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_reasons() {
        let err = PluginError::Blacklisted {
            symbol: "malloc".into(),
            libc: true,
        };
        assert_eq!(format!("{err}"), "malloc from libc is blacklisted");

        let err = PluginError::Blacklisted {
            symbol: "ev_run".into(),
            libc: false,
        };
        assert_eq!(format!("{err}"), "ev_run blacklisted");
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(format!("{}", StoreError::NoRow), "no row");
        assert_eq!(
            format!("{}", StoreError::BadMapping('x')),
            "invalid extraction mapping character: 'x'"
        );
    }
}

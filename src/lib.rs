//! # cinder
//!
//! A multi-network IRC bot with dynamically loaded command modules.
//!
//! Each configured network is one live instance with its own connection,
//! nickname, channels, module set, and SQLite database. Channel commands
//! dispatch to modules running on a supervised worker thread with
//! per-command timeouts, crash recovery, and a per-invocation resource
//! arena; everything a module says goes out through a flood-limited
//! transmitter.
//!
//! ## Architecture
//!
//! - [`manager`] - the multiplexer over every instance socket
//! - [`instance`] - per-network protocol state, sans-IO
//! - [`exec`] - the job FIFO, worker thread, and fault recovery
//! - [`plugin`] - the loader, symbol whitelist, arena, and module API
//! - [`queue`] / [`codec`] / [`message`] / [`colors`] - the wire layer
//! - [`store`] / [`access`] / [`regexcache`] / [`rng`] - instance services

#![deny(clippy::all)]

pub mod access;
pub mod casemap;
pub mod codec;
pub mod colors;
pub mod config;
pub mod error;
pub mod exec;
pub mod instance;
pub mod manager;
pub mod message;
pub mod plugin;
pub mod queue;
pub mod regexcache;
pub mod rng;
pub mod store;
pub mod transport;

pub use self::access::AccessOutcome;
pub use self::codec::LineCodec;
pub use self::config::Config;
pub use self::error::{Error, Result};
pub use self::exec::{CommandChannel, Job, COMMAND_TIMEOUT};
pub use self::instance::{Action, InstanceCore, ModuleStatus};
pub use self::manager::Manager;
pub use self::message::{Command, Line, Prefix, Reply};
pub use self::plugin::api::ModuleCtx;
pub use self::plugin::{Module, ModuleManager};
pub use self::queue::{OutboundQueue, FLOOD_INTERVAL, FLOOD_LINES, MAX_WIRE_LINE};
pub use self::store::{Row, SqlParam, Store};
pub use self::transport::{Listener, RestartHint, TlsConfig, Transport};

//! The module API surface.
//!
//! A [`ModuleCtx`] is the only handle a module gets while its entrypoint
//! runs. Every call is a cancellation checkpoint: a job past its deadline
//! unwinds at the next API call. Every call that hands out a reference to
//! heap data routes it through the job's [`Arena`], so the
//! job's resources are bounded to the invocation no matter what the module
//! does with them.
//!
//! Modules link against this crate and are built with the same toolchain
//! as the bot; entrypoints are plain Rust function pointers.

use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::access::{self, AccessOutcome};
use crate::error::StoreError;
use crate::exec::CancelToken;
use crate::instance::{InstanceCore, ModuleStatus};
use crate::plugin::arena::Arena;
use crate::plugin::Module;
use crate::store::{Row, SqlParam};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// The capability set handed to a running module.
pub struct ModuleCtx {
    module: Arc<Module>,
    link: Arc<InstanceCore>,
    arena: Arena,
    cancel: CancelToken,
}

impl ModuleCtx {
    pub(crate) fn new(module: Arc<Module>, link: Arc<InstanceCore>, cancel: CancelToken) -> Self {
        Self {
            module,
            link,
            arena: Arena::new(),
            cancel,
        }
    }

    fn checkpoint(&self) {
        self.cancel.check();
    }

    // --- identity -----------------------------------------------------

    /// This module's name.
    pub fn module_name(&self) -> &str {
        self.checkpoint();
        self.module.name()
    }

    /// The bot's current nickname on this network.
    pub fn nick(&self) -> String {
        self.checkpoint();
        self.link.nick()
    }

    /// The network name from configuration.
    pub fn network(&self) -> &str {
        self.checkpoint();
        self.link.name()
    }

    /// The command prefix.
    pub fn pattern(&self) -> String {
        self.checkpoint();
        self.link.pattern()
    }

    /// Replace the command prefix.
    pub fn set_pattern(&self, pattern: &str) {
        self.checkpoint();
        self.link.set_pattern(pattern);
    }

    /// Topic of a channel; `"(No topic)"` when unknown.
    pub fn topic(&self, channel: &str) -> &str {
        self.checkpoint();
        match self.link.topic_of(channel) {
            Some(topic) => self.arena.track(topic).as_str(),
            None => "(No topic)",
        }
    }

    /// Sorted nicks present on a channel.
    pub fn users(&self, channel: &str) -> Option<&[String]> {
        self.checkpoint();
        self.link
            .users_of(channel)
            .map(|users| self.arena.track(users).as_slice())
    }

    /// Sorted names of every joined channel.
    pub fn channels(&self) -> &[String] {
        self.checkpoint();
        self.arena.track(self.link.channel_names()).as_slice()
    }

    /// Sorted names of every loaded module.
    pub fn modules_loaded(&self) -> &[String] {
        self.checkpoint();
        self.arena.track(self.link.modules.loaded_names()).as_slice()
    }

    /// Sorted names of the modules enabled on a channel.
    pub fn modules_enabled(&self, channel: &str) -> Option<&[String]> {
        self.checkpoint();
        self.link
            .enabled_modules(channel)
            .map(|names| self.arena.track(names).as_slice())
    }

    /// Copy of this module's per-channel configuration.
    pub fn config(&self, channel: &str) -> Option<&BTreeMap<String, String>> {
        self.checkpoint();
        self.link
            .binding_config(channel, self.module.name())
            .map(|config| self.arena.track(config))
    }

    // --- messaging ----------------------------------------------------

    /// Say something; colour markup is honored.
    pub fn write(&self, target: &str, text: &str) {
        self.checkpoint();
        self.link.write(target, text);
    }

    /// Emote something; colour markup is honored.
    pub fn action(&self, target: &str, text: &str) {
        self.checkpoint();
        self.link.action(target, text);
    }

    /// Join a channel.
    pub fn join(&self, channel: &str) {
        self.checkpoint();
        self.link.join_channel(channel);
    }

    /// Part a channel.
    pub fn part(&self, channel: &str) {
        self.checkpoint();
        self.link.part_channel(channel);
    }

    // --- module management --------------------------------------------

    /// Enable a loaded module on a channel.
    pub fn enable_module(&self, channel: &str, module: &str) -> ModuleStatus {
        self.checkpoint();
        self.link.enable_module(channel, module, None)
    }

    /// Disable a module on a channel.
    pub fn disable_module(&self, channel: &str, module: &str) -> ModuleStatus {
        self.checkpoint();
        self.link.disable_module(channel, module)
    }

    /// Unload a module unless other channels still bind it.
    pub fn unload_module(&self, channel: &str, module: &str, force: bool) -> ModuleStatus {
        self.checkpoint();
        self.link.unload_module(channel, module, force)
    }

    /// Reload a module from disk.
    pub fn reload_module(&self, module: &str) -> ModuleStatus {
        self.checkpoint();
        self.link.reload_module(module)
    }

    // --- store --------------------------------------------------------

    /// Run a statement to completion.
    pub fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<usize, StoreError> {
        self.checkpoint();
        self.link.store.lock().execute(sql, params)
    }

    /// Fetch the first row of a query with the given extraction mapping.
    pub fn query_row(
        &self,
        sql: &str,
        params: &[SqlParam],
        fields: &str,
    ) -> Result<Option<Row>, StoreError> {
        self.checkpoint();
        self.link.store.lock().query_row(sql, params, fields)
    }

    /// Fetch every row of a query with the given extraction mapping.
    pub fn query_rows(
        &self,
        sql: &str,
        params: &[SqlParam],
        fields: &str,
    ) -> Result<Vec<Row>, StoreError> {
        self.checkpoint();
        self.link.store.lock().query_rows(sql, params, fields)
    }

    /// Bump the hit counter for a table.
    pub fn request(&self, table: &str) -> Result<(), StoreError> {
        self.checkpoint();
        self.link.store.lock().request(table)
    }

    /// Read the hit counter for a table.
    pub fn request_count(&self, table: &str) -> Result<i64, StoreError> {
        self.checkpoint();
        self.link.store.lock().request_count(table)
    }

    // --- access control -----------------------------------------------

    /// Access level of `target` on `channel`.
    pub fn access_level(&self, channel: &str, target: &str) -> Option<i64> {
        self.checkpoint();
        access::level(&self.link.store.lock(), channel, target).unwrap_or(None)
    }

    /// Add `target` to the access list.
    pub fn access_insert(
        &self,
        channel: &str,
        target: &str,
        invoker: &str,
        level: i64,
    ) -> AccessOutcome {
        self.checkpoint();
        access::insert(&self.link.store.lock(), channel, target, invoker, level)
    }

    /// Remove `target` from the access list.
    pub fn access_remove(&self, channel: &str, target: &str, invoker: &str) -> AccessOutcome {
        self.checkpoint();
        access::remove(&self.link.store.lock(), channel, target, invoker)
    }

    /// Change `target`'s level.
    pub fn access_change(
        &self,
        channel: &str,
        target: &str,
        invoker: &str,
        level: i64,
    ) -> AccessOutcome {
        self.checkpoint();
        access::change(&self.link.store.lock(), channel, target, invoker, level)
    }

    /// Whether `target` sits exactly at `level`.
    pub fn access_check(&self, channel: &str, target: &str, level: i64) -> bool {
        self.checkpoint();
        access::check(&self.link.store.lock(), channel, target, level)
    }

    /// Whether `target` sits at `level` or above.
    pub fn access_range(&self, channel: &str, target: &str, level: i64) -> bool {
        self.checkpoint();
        access::range(&self.link.store.lock(), channel, target, level)
    }

    // --- regex --------------------------------------------------------

    /// Fetch or compile a cached expression.
    pub fn regex(&self, pattern: &str, icase: bool) -> Result<Arc<Regex>, regex::Error> {
        self.checkpoint();
        self.link.regex.compile(pattern, icase)
    }

    // --- rng ----------------------------------------------------------

    /// Uniform `u32` from this module's generator.
    pub fn urand(&self) -> u32 {
        self.checkpoint();
        self.module.rng.urand()
    }

    /// Uniform `f64` in `[0, 1)` from this module's generator.
    pub fn drand(&self) -> f64 {
        self.checkpoint();
        self.module.rng.drand()
    }

    // --- net helpers --------------------------------------------------

    /// Resolve a hostname to its addresses.
    pub fn dns_resolve(&self, host: &str) -> std::io::Result<&[IpAddr]> {
        self.checkpoint();
        let addrs: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect();
        Ok(self.arena.track(addrs).as_slice())
    }

    /// Fetch a URL body as text, with a bounded timeout.
    pub fn http_fetch(&self, url: &str) -> Result<&str, reqwest::Error> {
        self.checkpoint();
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        let body = client.get(url).send()?.error_for_status()?.text()?;
        Ok(self.arena.track(body).as_str())
    }

    // --- tracked allocations ------------------------------------------

    /// Pin an arbitrary value to the job; it is dropped when the job ends.
    pub fn keep<T: Send + 'static>(&self, value: T) -> &T {
        self.checkpoint();
        self.arena.track(value)
    }

    /// Number of objects the job currently tracks.
    pub fn tracked(&self) -> usize {
        self.arena.len()
    }
}

/// Render a duration in seconds as `1w2d3h4m5s`, dropping zero units.
pub fn format_duration(mut seconds: u64) -> String {
    if seconds == 0 {
        return "0".to_string();
    }

    const STEPS: [(u64, &str); 5] = [
        (60 * 60 * 24 * 7, "w"),
        (60 * 60 * 24, "d"),
        (60 * 60, "h"),
        (60, "m"),
        (1, "s"),
    ];

    let mut out = String::new();
    for (unit, suffix) in STEPS {
        let count = seconds / unit;
        seconds %= unit;
        if count != 0 {
            out.push_str(&format!("{count}{suffix}"));
        }
    }
    out
}

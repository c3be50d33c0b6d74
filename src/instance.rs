//! Per-network instance state.
//!
//! An [`InstanceCore`] holds everything one connection owns: nickname,
//! command prefix, channels with their users and module bindings, the
//! outbound queue, the store, the regex cache, and the module manager.
//! Protocol handling is sans-IO: [`InstanceCore::feed`] consumes one
//! cleaned line and returns [`Action`]s for the multiplexer to carry out.
//! Inline replies (PONG, registration, NickServ, kick-on-sight) bypass the
//! flood-limited queue; everything else a module says goes through it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::access;
use crate::casemap::irc_to_lower;
use crate::message::{Command, Line, Reply};
use crate::plugin::{Module, ModuleManager};
use crate::queue::OutboundQueue;
use crate::regexcache::RegexCache;
use crate::store::Store;

/// Modules bound by default on channels joined at runtime.
const DEFAULT_CHANNEL_MODULES: [&str; 3] = ["system", "access", "module"];

/// A user present on a channel.
#[derive(Debug, Clone)]
pub struct User {
    /// Nick as displayed.
    pub nick: String,
    /// `user@host` portion when known.
    pub userhost: String,
}

/// A module enabled on a channel, with its configuration copy.
#[derive(Debug, Clone, Default)]
pub struct ModuleBinding {
    /// Key/value configuration copied at enable time.
    pub config: BTreeMap<String, String>,
}

/// The last inbound channel message, pending ambient dispatch.
#[derive(Debug, Clone)]
pub struct LastMessage {
    /// Sender nick.
    pub nick: String,
    /// Message text.
    pub content: String,
}

/// One joined channel.
#[derive(Debug, Default)]
pub struct ChannelState {
    /// Channel name as displayed.
    pub name: String,
    /// Topic, once numeric 332 arrives.
    pub topic: Option<String>,
    /// Users keyed by folded nick.
    pub users: BTreeMap<String, User>,
    /// Module bindings keyed by module name.
    pub bindings: BTreeMap<String, ModuleBinding>,
    /// Pending message for ambient modules.
    pub last: Option<LastMessage>,
}

/// Outcome of a module enable/disable/unload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Applied.
    Success,
    /// Already in the requested state.
    Already,
    /// No such module or channel.
    Nonexist,
    /// The operation failed.
    Failure,
    /// Still referenced by other channels; use force to override.
    Referenced,
}

/// What the multiplexer should do with a consumed line.
#[derive(Debug)]
pub enum Action {
    /// Write this wire line immediately, outside the flood limiter.
    SendNow(String),
    /// Enqueue a command invocation.
    Dispatch {
        /// Module to run.
        module: Arc<Module>,
        /// Reply target (channel, or the sender for queries).
        channel: String,
        /// Invoking nick.
        user: String,
        /// Text after the command token.
        message: String,
    },
    /// The server killed us; tear the instance down.
    Teardown,
}

/// Shared state of one network instance.
pub struct InstanceCore {
    name: String,
    nick: RwLock<String>,
    pattern: RwLock<String>,
    auth: Option<String>,
    channels: RwLock<BTreeMap<String, ChannelState>>,
    /// Outbound FIFO; the multiplexer drains it under the flood limiter.
    pub queue: Mutex<OutboundQueue>,
    /// Per-instance database.
    pub store: Mutex<Store>,
    /// Per-instance compiled-regex cache.
    pub regex: RegexCache,
    /// Per-instance module set.
    pub modules: ModuleManager,
    waker: Mutex<Option<Arc<Notify>>>,
    ready: AtomicBool,
    synchronized: AtomicBool,
    identified: AtomicBool,
}

impl InstanceCore {
    /// A fresh, unconnected instance.
    pub fn new(
        name: &str,
        nick: &str,
        pattern: &str,
        auth: Option<String>,
        store: Store,
        modules_dir: PathBuf,
    ) -> Self {
        Self {
            name: name.to_string(),
            nick: RwLock::new(nick.to_string()),
            pattern: RwLock::new(pattern.to_string()),
            auth,
            channels: RwLock::new(BTreeMap::new()),
            queue: Mutex::new(OutboundQueue::new()),
            store: Mutex::new(store),
            regex: RegexCache::new(),
            modules: ModuleManager::new(modules_dir),
            waker: Mutex::new(None),
            ready: AtomicBool::new(false),
            synchronized: AtomicBool::new(false),
            identified: AtomicBool::new(false),
        }
    }

    /// Network name from configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current nickname.
    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    /// Current command prefix.
    pub fn pattern(&self) -> String {
        self.pattern.read().clone()
    }

    /// Replace the command prefix.
    pub fn set_pattern(&self, pattern: &str) {
        *self.pattern.write() = pattern.to_string();
    }

    /// Whether the server accepted registration.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether configured channels have been joined.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    /// Attach the multiplexer's wake handle.
    pub fn set_waker(&self, notify: Arc<Notify>) {
        *self.waker.lock() = Some(notify);
    }

    /// Wake the multiplexer so the queue drains promptly.
    pub fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            waker.notify_one();
        }
    }

    /// The NICK/USER burst, produced exactly once per connection.
    pub fn registration(&self) -> Option<String> {
        if self.identified.swap(true, Ordering::SeqCst) {
            return None;
        }
        let nick = self.nick();
        Some(format!("NICK {nick}\r\nUSER {nick} localhost 0 :cinder\r\n"))
    }

    /// Mark the instance reconnected-in-place (restart hint path): the
    /// server will not replay the welcome burst.
    pub fn reinstate(&self) {
        self.identified.store(true, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
    }

    // --- outbound helpers ---------------------------------------------

    /// Queue a PRIVMSG and wake the multiplexer.
    pub fn write(&self, target: &str, text: &str) {
        self.queue.lock().privmsg(target, text);
        self.wake();
    }

    /// Queue an ACTION and wake the multiplexer.
    pub fn action(&self, target: &str, text: &str) {
        self.queue.lock().action(target, text);
        self.wake();
    }

    /// Join a channel at runtime: queue the JOIN and create local state
    /// with the default module bindings.
    pub fn join_channel(&self, channel: &str) {
        self.queue.lock().join(channel);
        self.wake();

        let bindings = DEFAULT_CHANNEL_MODULES
            .iter()
            .map(|name| (name.to_string(), BTreeMap::new()))
            .collect::<Vec<_>>();
        self.add_channel(channel, &bindings);
    }

    /// Part a channel: drop local state and queue the PART.
    pub fn part_channel(&self, channel: &str) {
        let removed = self
            .channels
            .write()
            .remove(&irc_to_lower(channel))
            .is_some();
        if removed {
            self.queue.lock().part(channel);
            self.wake();
        }
    }

    // --- channel bookkeeping ------------------------------------------

    /// Create channel state with the given module bindings. Existing
    /// state is left untouched.
    pub fn add_channel(&self, name: &str, bindings: &[(String, BTreeMap<String, String>)]) {
        let key = irc_to_lower(name);
        let mut channels = self.channels.write();
        if channels.contains_key(&key) {
            debug!(channel = name, "channel already exists");
            return;
        }
        let mut state = ChannelState {
            name: name.to_string(),
            ..Default::default()
        };
        for (module, config) in bindings {
            state.bindings.insert(
                module.clone(),
                ModuleBinding {
                    config: config.clone(),
                },
            );
        }
        channels.insert(key, state);
        info!(channel = name, "channel added");
    }

    /// Names of every joined channel, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Sorted nicks present on a channel.
    pub fn users_of(&self, channel: &str) -> Option<Vec<String>> {
        let channels = self.channels.read();
        let state = channels.get(&irc_to_lower(channel))?;
        let mut nicks: Vec<String> = state.users.values().map(|u| u.nick.clone()).collect();
        nicks.sort();
        Some(nicks)
    }

    /// Topic of a channel, when one has been seen.
    pub fn topic_of(&self, channel: &str) -> Option<String> {
        self.channels
            .read()
            .get(&irc_to_lower(channel))
            .and_then(|c| c.topic.clone())
    }

    /// Sorted module names enabled on a channel.
    pub fn enabled_modules(&self, channel: &str) -> Option<Vec<String>> {
        let channels = self.channels.read();
        let state = channels.get(&irc_to_lower(channel))?;
        Some(state.bindings.keys().cloned().collect())
    }

    /// Copy of a module's per-channel configuration.
    pub fn binding_config(&self, channel: &str, module: &str) -> Option<BTreeMap<String, String>> {
        self.channels
            .read()
            .get(&irc_to_lower(channel))
            .and_then(|c| c.bindings.get(module))
            .map(|b| b.config.clone())
    }

    /// The pending message on a channel, if any.
    pub fn last_message(&self, channel: &str) -> Option<LastMessage> {
        self.channels
            .read()
            .get(&irc_to_lower(channel))
            .and_then(|c| c.last.clone())
    }

    /// Take (and clear) the pending message on a channel.
    pub fn take_last_message(&self, channel: &str) -> Option<LastMessage> {
        self.channels
            .write()
            .get_mut(&irc_to_lower(channel))
            .and_then(|c| c.last.take())
    }

    // --- module enable/disable ----------------------------------------

    /// Enable a loaded module on a channel, copying `config` (or binding
    /// an empty configuration when none exists).
    pub fn enable_module(
        &self,
        channel: &str,
        module: &str,
        config: Option<&BTreeMap<String, String>>,
    ) -> ModuleStatus {
        let mut channels = self.channels.write();
        let Some(state) = channels.get_mut(&irc_to_lower(channel)) else {
            return ModuleStatus::Nonexist;
        };
        if state.bindings.contains_key(module) {
            return ModuleStatus::Already;
        }
        if self.modules.by_name(module).is_none() {
            return ModuleStatus::Nonexist;
        }
        state.bindings.insert(
            module.to_string(),
            ModuleBinding {
                config: config.cloned().unwrap_or_default(),
            },
        );
        ModuleStatus::Success
    }

    /// Disable a module on a channel.
    pub fn disable_module(&self, channel: &str, module: &str) -> ModuleStatus {
        let mut channels = self.channels.write();
        let Some(state) = channels.get_mut(&irc_to_lower(channel)) else {
            return ModuleStatus::Nonexist;
        };
        if state.bindings.remove(module).is_some() {
            return ModuleStatus::Success;
        }
        if self.modules.by_name(module).is_some() {
            return ModuleStatus::Already;
        }
        ModuleStatus::Nonexist
    }

    /// How many channels other than `exclude` bind `module`.
    pub fn module_refs(&self, module: &str, exclude: &str) -> usize {
        let exclude = irc_to_lower(exclude);
        self.channels
            .read()
            .iter()
            .filter(|(key, _)| **key != exclude)
            .filter(|(_, state)| state.bindings.contains_key(module))
            .count()
    }

    /// Unload a module unless other channels still reference it.
    pub fn unload_module(&self, channel: &str, module: &str, force: bool) -> ModuleStatus {
        if self.module_refs(module, channel) != 0 && !force {
            return ModuleStatus::Referenced;
        }
        match self.modules.unload(module, self) {
            Ok(()) => ModuleStatus::Success,
            Err(_) => ModuleStatus::Failure,
        }
    }

    /// Reload a module: close and drop the old code, then load afresh.
    /// Everywhere the module is bound sees the new code; jobs still
    /// holding the old load are dropped by the execution engine.
    pub fn reload_module(&self, module: &str) -> ModuleStatus {
        if self.modules.unload(module, self).is_err() {
            return ModuleStatus::Failure;
        }
        let result = {
            let store = self.store.lock();
            self.modules.load(module, &store)
        };
        match result {
            Ok(_) => ModuleStatus::Success,
            Err(_) => ModuleStatus::Failure,
        }
    }

    // --- inbound ------------------------------------------------------

    /// Consume one cleaned line and produce multiplexer actions.
    pub fn feed(&self, text: &str) -> Vec<Action> {
        let Ok(line) = Line::parse(text) else {
            // Protocol errors are dropped silently.
            return Vec::new();
        };

        match line.command {
            Command::Word("PING") => match line.param(0) {
                Some(token) => vec![Action::SendNow(format!("PONG :{token}\r\n"))],
                None => Vec::new(),
            },
            Command::Numeric(code) => self.feed_numeric(code, &line),
            Command::Word("PRIVMSG") => self.feed_privmsg(&line),
            Command::Word("NOTICE") => self.feed_notice(&line),
            Command::Word("KILL") => vec![Action::Teardown],
            Command::Word("JOIN") => self.feed_join(&line),
            Command::Word("PART") => {
                if let (Some(prefix), Some(channel)) = (line.prefix, line.param(0)) {
                    self.remove_user(channel, prefix.nick());
                }
                Vec::new()
            }
            Command::Word("QUIT") => {
                if let Some(prefix) = line.prefix {
                    let nick = irc_to_lower(prefix.nick());
                    let mut channels = self.channels.write();
                    for state in channels.values_mut() {
                        state.users.remove(&nick);
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn feed_numeric(&self, code: u16, line: &Line<'_>) -> Vec<Action> {
        match Reply::from_code(code) {
            Some(Reply::Welcome) => {
                self.ready.store(true, Ordering::SeqCst);
                info!(instance = %self.name, "ready");
                Vec::new()
            }
            Some(Reply::EndOfMotd) | Some(Reply::NoMotd) => {
                let joins = self
                    .channel_names()
                    .into_iter()
                    .map(|chan| Action::SendNow(format!("JOIN {chan}\r\n")))
                    .collect();
                self.synchronized.store(true, Ordering::SeqCst);
                joins
            }
            Some(Reply::Topic) => {
                if let (Some(channel), Some(topic)) = (line.param(1), line.param(2)) {
                    if let Some(state) = self.channels.write().get_mut(&irc_to_lower(channel)) {
                        state.topic = Some(topic.to_string());
                    }
                }
                Vec::new()
            }
            Some(Reply::NamReply) => {
                if let (Some(channel), Some(names)) = (line.param(2), line.param(3)) {
                    for name in names.split(' ').filter(|n| !n.is_empty()) {
                        let nick = name.trim_start_matches(['@', '+', '%', '&', '~']);
                        self.insert_user(channel, nick, "");
                    }
                }
                Vec::new()
            }
            Some(Reply::NicknameInUse) => {
                let nick = {
                    let mut nick = self.nick.write();
                    nick.push('_');
                    nick.clone()
                };
                vec![Action::SendNow(format!("NICK {nick}\r\n"))]
            }
            Some(Reply::Motd) | None => Vec::new(),
        }
    }

    fn feed_privmsg(&self, line: &Line<'_>) -> Vec<Action> {
        let (Some(prefix), Some(target), Some(content)) =
            (line.prefix, line.param(0), line.param(1))
        else {
            return Vec::new();
        };

        let nick = prefix.nick().to_string();
        let content = content.trim_end().to_string();

        let channel_name = {
            let mut channels = self.channels.write();
            match channels.get_mut(&irc_to_lower(target)) {
                Some(state) => {
                    state.last = Some(LastMessage {
                        nick: nick.clone(),
                        content: content.clone(),
                    });
                    Some(state.name.clone())
                }
                None => None,
            }
        };

        // Replies to queries go back to the sender.
        let reply_target = channel_name.clone().unwrap_or_else(|| nick.clone());

        if nick == self.nick() {
            return Vec::new();
        }
        {
            let store = self.store.lock();
            if access::ignore(&store, &reply_target, &nick) {
                return Vec::new();
            }
        }

        let pattern = self.pattern();
        let Some(rest) = content.strip_prefix(pattern.as_str()) else {
            return Vec::new();
        };
        let token = rest.split(' ').next().unwrap_or("");
        if token.is_empty() {
            return Vec::new();
        }

        let Some(module) = self.modules.by_command(token) else {
            self.write(
                &nick,
                &format!(
                    "Sorry, there is no command named {token} available. \
                     I do however, take requests if asked nicely."
                ),
            );
            return Vec::new();
        };

        // On a channel the module must be enabled there; queries skip the
        // binding check.
        if let Some(ref chan) = channel_name {
            let enabled = self
                .channels
                .read()
                .get(&irc_to_lower(chan))
                .map_or(false, |state| state.bindings.contains_key(module.name()));
            if !enabled {
                return Vec::new();
            }
        }

        let message = rest[token.len()..].trim_start().to_string();
        vec![Action::Dispatch {
            module,
            channel: reply_target,
            user: nick,
            message,
        }]
    }

    fn feed_notice(&self, line: &Line<'_>) -> Vec<Action> {
        let (Some(prefix), Some(text)) = (line.prefix, line.param(1)) else {
            return Vec::new();
        };
        let Some(auth) = self.auth.as_ref() else {
            return Vec::new();
        };
        if prefix.nick() != "NickServ" {
            return Vec::new();
        }

        if text.contains("You are now identified") {
            info!(instance = %self.name, "authenticated");
            Vec::new()
        } else if text.contains("This nickname is registered") {
            let nick = self.nick();
            vec![Action::SendNow(format!(
                "PRIVMSG NickServ :IDENTIFY {nick} {auth}\r\n"
            ))]
        } else {
            Vec::new()
        }
    }

    fn feed_join(&self, line: &Line<'_>) -> Vec<Action> {
        let (Some(prefix), Some(channel)) = (line.prefix, line.param(0)) else {
            return Vec::new();
        };
        let nick = prefix.nick();

        let banned = {
            let store = self.store.lock();
            access::shitlist(&store, channel, nick)
        };
        if banned {
            return vec![Action::SendNow(format!(
                "KICK {channel} {nick} :you are banned\r\n"
            ))];
        }

        self.insert_user(channel, nick, prefix.userhost().unwrap_or(""));
        Vec::new()
    }

    fn insert_user(&self, channel: &str, nick: &str, userhost: &str) {
        let mut channels = self.channels.write();
        let Some(state) = channels.get_mut(&irc_to_lower(channel)) else {
            return;
        };
        let key = irc_to_lower(nick);
        state.users.entry(key).or_insert_with(|| User {
            nick: nick.to_string(),
            userhost: userhost.to_string(),
        });
    }

    fn remove_user(&self, channel: &str, nick: &str) {
        let mut channels = self.channels.write();
        if let Some(state) = channels.get_mut(&irc_to_lower(channel)) {
            state.users.remove(&irc_to_lower(nick));
        }
    }
}

impl std::fmt::Debug for InstanceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCore")
            .field("name", &self.name)
            .field("nick", &self.nick())
            .field("channels", &self.channel_names())
            .finish()
    }
}

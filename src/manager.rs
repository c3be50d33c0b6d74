//! The instance multiplexer.
//!
//! Owns every network instance plus the one [`CommandChannel`] that serves
//! them all. Each connected instance gets a reader task decoding lines
//! into a shared channel; the main loop selects over inbound lines, a
//! drain tick, the wake notifier (signalled by workers after they enqueue
//! replies, so drains happen promptly), and shutdown. Per tick it drains
//! outbound queues under the flood limiter and broadcasts jobs for
//! ambient modules.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::FramedRead;
use tracing::{info, warn};

use crate::access;
use crate::codec::LineCodec;
use crate::exec::{CommandChannel, Job, COMMAND_TIMEOUT};
use crate::instance::{Action, InstanceCore};
use crate::transport::{BoxWrite, TlsConfig, Transport};

struct InstanceRuntime {
    core: Arc<InstanceCore>,
    writer: Option<BoxWrite>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

/// Multiplexer over every configured instance.
pub struct Manager {
    instances: Vec<InstanceRuntime>,
    channel: CommandChannel,
    wake: Arc<Notify>,
    lines_tx: mpsc::UnboundedSender<(usize, Option<String>)>,
    lines_rx: mpsc::UnboundedReceiver<(usize, Option<String>)>,
}

impl Manager {
    /// A manager with the default command timeout.
    pub fn new() -> Self {
        Self::with_command_timeout(COMMAND_TIMEOUT)
    }

    /// A manager with a custom command timeout.
    pub fn with_command_timeout(timeout: Duration) -> Self {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        Self {
            instances: Vec::new(),
            channel: CommandChannel::with_timeout(timeout),
            wake: Arc::new(Notify::new()),
            lines_tx,
            lines_rx,
        }
    }

    /// Register an instance; returns its index.
    pub fn add_instance(&mut self, core: Arc<InstanceCore>) -> usize {
        core.set_waker(Arc::clone(&self.wake));
        self.instances.push(InstanceRuntime {
            core,
            writer: None,
            reader: None,
        });
        self.instances.len() - 1
    }

    /// Find an instance by network name.
    pub fn find(&self, name: &str) -> Option<Arc<InstanceCore>> {
        self.instances
            .iter()
            .find(|rt| rt.core.name() == name)
            .map(|rt| Arc::clone(&rt.core))
    }

    /// Whether no instances are registered.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Connect an instance and start its reader task.
    pub async fn connect(
        &mut self,
        idx: usize,
        host: &str,
        port: u16,
        tls: Option<&TlsConfig>,
    ) -> crate::error::Result<()> {
        let transport = Transport::connect(host, port, tls).await?;
        self.attach(idx, transport).await;
        Ok(())
    }

    /// Attach an already-connected transport to an instance.
    pub async fn attach(&mut self, idx: usize, transport: Transport) {
        let (read, write) = transport.split();
        let core = Arc::clone(&self.instances[idx].core);
        let tx = self.lines_tx.clone();

        let reader = tokio::spawn(async move {
            let mut framed = FramedRead::new(read, LineCodec::new());
            while let Some(result) = framed.next().await {
                match result {
                    Ok(line) => {
                        if tx.send((idx, Some(line))).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "read error");
                        break;
                    }
                }
            }
            let _ = tx.send((idx, None));
        });

        let runtime = &mut self.instances[idx];
        runtime.writer = Some(write);
        runtime.reader = Some(reader);

        if let Some(burst) = core.registration() {
            self.write_now(idx, &burst).await;
        }
        info!(instance = self.instances[idx].core.name(), "attached");
    }

    async fn write_now(&mut self, idx: usize, line: &str) {
        let Some(writer) = self.instances[idx].writer.as_mut() else {
            return;
        };
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            warn!(instance = self.instances[idx].core.name(), %err, "write failed");
        }
    }

    fn detach(&mut self, idx: usize, reason: &str) {
        let runtime = &mut self.instances[idx];
        warn!(instance = runtime.core.name(), reason, "detached");
        runtime.writer = None;
        if let Some(reader) = runtime.reader.take() {
            reader.abort();
        }
    }

    async fn handle_line(&mut self, idx: usize, line: String) {
        let core = Arc::clone(&self.instances[idx].core);
        for action in core.feed(&line) {
            match action {
                Action::SendNow(wire) => self.write_now(idx, &wire).await,
                Action::Dispatch {
                    module,
                    channel,
                    user,
                    message,
                } => {
                    self.channel.push(Job {
                        module,
                        link: Arc::clone(&core),
                        channel,
                        user,
                        message,
                    });
                }
                Action::Teardown => self.detach(idx, "killed by server"),
            }
        }
    }

    async fn drain(&mut self) {
        let now = Instant::now();
        for idx in 0..self.instances.len() {
            if self.instances[idx].writer.is_none() {
                continue;
            }
            let lines = {
                let core = &self.instances[idx].core;
                core.queue.lock().drain(now)
            };
            for line in lines {
                self.write_now(idx, &line).await;
            }
        }
    }

    /// Enqueue jobs for ambient modules: interval modules when due,
    /// always-modules for every channel with a pending message.
    fn broadcast(&self, now: Instant) {
        for runtime in &self.instances {
            let core = &runtime.core;
            if !core.is_synchronized() {
                continue;
            }

            for module in core.modules.ambient_modules() {
                let interval = module.interval().is_some();
                if interval && !module.interval_due(now) {
                    continue;
                }

                for chan in core.channel_names() {
                    let last = if interval {
                        core.last_message(&chan)
                    } else {
                        match core.take_last_message(&chan) {
                            Some(last) => Some(last),
                            None => continue,
                        }
                    };

                    if let Some(ref last) = last {
                        let ignored = {
                            let store = core.store.lock();
                            access::ignore(&store, &chan, &last.nick)
                        };
                        if ignored {
                            continue;
                        }
                    }

                    let (user, message) = last
                        .map(|l| (l.nick, l.content))
                        .unwrap_or_default();
                    self.channel.push(Job {
                        module: Arc::clone(&module),
                        link: Arc::clone(core),
                        channel: chan,
                        user,
                        message,
                    });
                }
            }
        }
    }

    fn maybe_clear_unloaded(&self) {
        if self.channel.pending() == 0 {
            for runtime in &self.instances {
                runtime.core.modules.clear_unloaded();
            }
        }
    }

    fn tick_period(&self) -> Duration {
        let floor = Duration::from_secs(1);
        self.instances
            .iter()
            .filter_map(|rt| rt.core.modules.min_interval())
            .min()
            .map_or(floor, |shortest| shortest.min(floor))
    }

    /// Run until `shutdown` resolves, then tear everything down.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        self.channel.begin();

        let wake = Arc::clone(&self.wake);
        let mut tick = tokio::time::interval(self.tick_period());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.lines_rx.recv() => match received {
                    Some((idx, Some(line))) => self.handle_line(idx, line).await,
                    Some((idx, None)) => self.detach(idx, "connection closed"),
                    None => {}
                },
                _ = wake.notified() => self.drain().await,
                _ = tick.tick() => {
                    self.drain().await;
                    self.broadcast(Instant::now());
                    self.maybe_clear_unloaded();
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        info!("shutting down");
        self.drain().await;

        for idx in 0..self.instances.len() {
            if self.instances[idx].core.is_ready() {
                self.write_now(idx, "QUIT :Shutting down\r\n").await;
            }
            self.detach(idx, "shutdown");
        }

        // Let queued jobs finish, then stop the worker.
        self.channel.close();

        for runtime in &self.instances {
            runtime.core.modules.close_all(&runtime.core);
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::api::ModuleCtx;
    use crate::plugin::Module;
    use crate::store::Store;
    use std::path::PathBuf;

    fn noop(_: &ModuleCtx, _: &str, _: &str, _: &str) {}

    fn test_core(name: &str) -> Arc<InstanceCore> {
        let store = Store::open_in_memory().unwrap();
        let core = Arc::new(InstanceCore::new(
            name,
            "bot",
            "!",
            None,
            store,
            PathBuf::from("modules"),
        ));
        core.add_channel("#c", &[]);
        core
    }

    fn synchronize(core: &InstanceCore) {
        core.feed(":srv 001 bot :hi");
        core.feed(":srv 376 bot :done");
    }

    #[test]
    fn test_find_and_empty() {
        let mut manager = Manager::new();
        assert!(manager.is_empty());
        manager.add_instance(test_core("net"));
        assert!(!manager.is_empty());
        assert!(manager.find("net").is_some());
        assert!(manager.find("other").is_none());
    }

    #[test]
    fn test_broadcast_always_module_consumes_message() {
        let mut manager = Manager::new();
        let core = test_core("net");
        core.modules
            .insert_builtin(Module::builtin("watcher", "", None, noop, None))
            .unwrap();
        synchronize(&core);
        manager.add_instance(Arc::clone(&core));

        core.feed(":alice!a@h PRIVMSG #c :something");
        manager.broadcast(Instant::now());
        assert_eq!(manager.channel.pending(), 1);

        // The pending message was consumed; a re-broadcast stays quiet.
        manager.broadcast(Instant::now());
        assert_eq!(manager.channel.pending(), 1);
    }

    #[test]
    fn test_broadcast_interval_module_paced() {
        let mut manager = Manager::new();
        let core = test_core("net");
        core.modules
            .insert_builtin(Module::builtin(
                "ticker",
                "",
                Some(Duration::from_secs(60)),
                noop,
                None,
            ))
            .unwrap();
        synchronize(&core);
        manager.add_instance(Arc::clone(&core));

        let start = Instant::now();
        manager.broadcast(start);
        assert_eq!(manager.channel.pending(), 1);

        manager.broadcast(start + Duration::from_secs(30));
        assert_eq!(manager.channel.pending(), 1);

        manager.broadcast(start + Duration::from_secs(61));
        assert_eq!(manager.channel.pending(), 2);
    }

    #[test]
    fn test_broadcast_skips_unsynchronized() {
        let mut manager = Manager::new();
        let core = test_core("net");
        core.modules
            .insert_builtin(Module::builtin("watcher", "", None, noop, None))
            .unwrap();
        manager.add_instance(Arc::clone(&core));

        core.feed(":alice!a@h PRIVMSG #c :something");
        manager.broadcast(Instant::now());
        assert_eq!(manager.channel.pending(), 0);
    }

    #[test]
    fn test_tick_period_tracks_shortest_interval() {
        let mut manager = Manager::new();
        assert_eq!(manager.tick_period(), Duration::from_secs(1));

        let core = test_core("net");
        core.modules
            .insert_builtin(Module::builtin(
                "fast",
                "",
                Some(Duration::from_millis(250)),
                noop,
                None,
            ))
            .unwrap();
        manager.add_instance(core);
        assert_eq!(manager.tick_period(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_dispatch_through_handle_line() {
        let mut manager = Manager::new();
        let core = test_core("net");
        core.modules
            .insert_builtin(Module::builtin("family", "family", None, noop, None))
            .unwrap();
        core.enable_module("#c", "family", None);
        manager.add_instance(Arc::clone(&core));

        manager
            .handle_line(0, ":alice!a@h PRIVMSG #c :!family".to_string())
            .await;
        assert_eq!(manager.channel.pending(), 1);
    }
}

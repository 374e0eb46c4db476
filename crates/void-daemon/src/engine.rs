//! The rule engine: a single-writer command loop plus a reconcile ticker.
//!
//! Every mutation of the rule store flows through one worker task fed by a
//! bounded command channel. That serialization is the system's ordering
//! guarantee: each observable state transition is one worker step, and the
//! PF sync it triggers completes before the next command is taken. Two
//! concurrent block requests for the same domain therefore always converge
//! on one deterministic rule.
//!
//! The ticker enqueues a reconcile command every 30 seconds; reconcile
//! expires due rules and re-resolves stale ones. The worker never holds the
//! store lock across resolver or file I/O.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use void_core::pf::PfManager;
use void_core::resolver::{Resolver, ResolverError};
use void_core::rules::{Rule, RuleStore};

/// How often expiry and DNS refresh are checked. Shorter means more timely
/// expiry at the cost of more wakeups.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Small command buffer so senders rarely block.
const COMMAND_BUFFER: usize = 10;

#[derive(Debug)]
enum Command {
    Block { domain: String, ttl: Duration },
    Unblock { id: String },
    ReconcileTick,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is shutting down")]
    Closed,
}

/// Owns the worker and ticker tasks. Adapters talk to the engine through
/// cloneable [`EngineHandle`]s; the engine itself is held by `main` for
/// lifecycle control.
pub struct Engine {
    store: Arc<RuleStore>,
    pf: Arc<PfManager>,
    resolver: Arc<dyn Resolver>,
    dns_refresh: Duration,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    #[must_use]
    pub fn new(pf: PfManager, resolver: Arc<dyn Resolver>, dns_refresh: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            store: Arc::new(RuleStore::new()),
            pf: Arc::new(pf),
            resolver,
            dns_refresh,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// A cheap handle for the API server and CLI-facing adapters.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            cmd_tx: self.cmd_tx.clone(),
            store: Arc::clone(&self.store),
        }
    }

    /// Loads the rules already on disk into the store, then spawns the
    /// worker and ticker. Loading issues no PF sync: disk already matches
    /// memory. A malformed anchor file is logged and the store starts empty.
    pub fn run(&mut self) {
        let Some(cmd_rx) = self.cmd_rx.take() else {
            warn!("engine already running");
            return;
        };

        self.load_initial_rules();

        let worker = Worker {
            store: Arc::clone(&self.store),
            pf: Arc::clone(&self.pf),
            resolver: Arc::clone(&self.resolver),
            dns_refresh: self.dns_refresh,
        };
        self.tasks
            .push(tokio::spawn(worker.run(cmd_rx, self.cancel.clone())));
        self.tasks.push(tokio::spawn(run_ticker(
            self.cmd_tx.clone(),
            self.cancel.clone(),
        )));

        info!("engine started");
    }

    /// Signals cancellation and waits for the worker and ticker to drain
    /// and exit. The worker finishes its in-flight command, including the
    /// PF sync, before stopping.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "engine task terminated abnormally");
            }
        }
        info!("engine stopped");
    }

    fn load_initial_rules(&self) {
        match self.pf.current_rules() {
            Ok(rules) if rules.is_empty() => {
                info!("no existing anchor rules, starting fresh");
            }
            Ok(rules) => {
                let now = Utc::now();
                let mut loaded = 0usize;
                for mut rule in rules {
                    // A freshly loaded rule without a resolution timestamp
                    // would look stale and stampede the resolver on the
                    // first tick.
                    if rule.resolved_at.is_none() {
                        rule.resolved_at = Some(now);
                    }
                    if self.store.upsert(rule) {
                        loaded += 1;
                    }
                }
                info!(count = loaded, "loaded rules from anchor file");
            }
            Err(err) => {
                warn!(error = %err, "failed to load anchor file, starting with an empty ruleset");
            }
        }
    }
}

/// Cloneable front door to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Command>,
    store: Arc<RuleStore>,
}

impl EngineHandle {
    /// Enqueues a block command. Returns once the command is accepted;
    /// success does not imply the rule is live yet. A `ttl` of zero blocks
    /// permanently.
    pub async fn block(&self, domain: String, ttl: Duration) -> Result<(), EngineError> {
        self.cmd_tx
            .send(Command::Block { domain, ttl })
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Enqueues an unblock command without waiting. Dropped with a warning
    /// when the channel is saturated or the engine is shutting down.
    pub fn unblock(&self, id: String) {
        if let Err(err) = self.cmd_tx.try_send(Command::Unblock { id }) {
            match err {
                TrySendError::Full(Command::Unblock { id }) => {
                    warn!(%id, "command channel full, dropping unblock");
                }
                TrySendError::Closed(Command::Unblock { id }) => {
                    warn!(%id, "engine is shutting down, dropping unblock");
                }
                _ => {}
            }
        }
    }

    /// A value copy of the current rule set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Rule> {
        self.store.snapshot()
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.store.len()
    }
}

/// State shared by the worker's command handlers. Only this task mutates
/// the store once the engine is running.
struct Worker {
    store: Arc<RuleStore>,
    pf: Arc<PfManager>,
    resolver: Arc<dyn Resolver>,
    dns_refresh: Duration,
}

impl Worker {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        info!("engine worker started");
        loop {
            let cmd = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            let mutated = self.dispatch(cmd).await;
            if mutated {
                self.sync_pf().await;
            }
        }
        info!("engine worker stopped");
    }

    async fn dispatch(&self, cmd: Command) -> bool {
        match cmd {
            Command::Block { domain, ttl } => match self.handle_block(&domain, ttl).await {
                Ok(changed) => changed,
                Err(err) => {
                    warn!(%domain, error = %err, "block command failed");
                    false
                }
            },
            Command::Unblock { id } => self.handle_unblock(&id),
            Command::ReconcileTick => {
                let (changed, failures) = self.handle_reconcile().await;
                if !failures.is_empty() {
                    let summary: Vec<String> = failures
                        .iter()
                        .map(|(domain, err)| format!("{domain}: {err}"))
                        .collect();
                    warn!(errors = %summary.join("; "), "dns refresh failed for some rules");
                }
                changed
            }
        }
    }

    async fn handle_block(&self, domain: &str, ttl: Duration) -> Result<bool, ResolverError> {
        info!(%domain, ?ttl, "handling block request");

        let ips = self.resolver.lookup_host(domain).await?;
        if ips.is_empty() {
            return Err(ResolverError::NoRecords {
                domain: domain.to_string(),
            });
        }

        let now = Utc::now();
        let expires = (!ttl.is_zero()).then(|| now + clamp_duration(ttl));
        let rule = Rule::new(
            Uuid::new_v4().to_string(),
            domain.to_string(),
            ips,
            expires,
            Some(now),
        );

        let id = rule.id.clone();
        let changed = self.store.upsert(rule);
        if changed {
            info!(%id, %domain, "rule added or updated");
        }
        Ok(changed)
    }

    fn handle_unblock(&self, id: &str) -> bool {
        info!(%id, "handling unblock request");
        match self.store.remove(id) {
            Some(rule) => {
                info!(%id, domain = %rule.domain, "rule removed");
                true
            }
            None => {
                info!(%id, "unblock for unknown rule ignored");
                false
            }
        }
    }

    /// Expires due rules, then refreshes DNS for stale ones. Resolver
    /// failures are collected per domain so one bad name never hides the
    /// rest; the affected rules are kept as-is.
    async fn handle_reconcile(&self) -> (bool, Vec<(String, ResolverError)>) {
        debug!("reconcile cycle");
        let now = Utc::now();
        let mut changed = false;

        let expired = self.store.expire_now(now);
        for rule in &expired {
            info!(id = %rule.id, domain = %rule.domain, "rule expired");
        }
        if !expired.is_empty() {
            changed = true;
        }

        let stale_after = clamp_duration(self.dns_refresh * 9 / 10);
        let mut failures = Vec::new();

        for rule in self.store.snapshot() {
            let stale = match rule.resolved_at {
                None => true,
                Some(resolved_at) => now.signed_duration_since(resolved_at) > stale_after,
            };
            if !stale {
                continue;
            }

            debug!(id = %rule.id, domain = %rule.domain, "refreshing dns");
            let ips = match self.resolver.lookup_host(&rule.domain).await {
                Ok(ips) => ips,
                Err(err) => {
                    failures.push((rule.domain.clone(), err));
                    continue;
                }
            };

            if rule.same_ips(&ips) {
                if self.store.update_resolved_at(&rule.id, now) {
                    changed = true;
                }
            } else {
                info!(id = %rule.id, domain = %rule.domain, "address set changed");
                let updated = Rule {
                    ips,
                    resolved_at: Some(now),
                    ..rule
                };
                if self.store.upsert(updated) {
                    changed = true;
                }
            }
        }

        (changed, failures)
    }

    /// Best effort: a failed sync is logged and the in-memory state kept;
    /// the file is rewritten from scratch on the next sync anyway.
    async fn sync_pf(&self) {
        debug!("synchronizing pf anchor");
        let rules = self.store.snapshot();
        match self.pf.sync(&rules).await {
            Ok(()) => debug!(rules = rules.len(), "pf synchronization complete"),
            Err(err) => warn!(error = %err, "pf sync failed, keeping state for retry"),
        }
    }
}

/// Ticker task: enqueues a reconcile command on a fixed cadence. A full
/// channel drops the tick; the next one covers the backlog.
async fn run_ticker(cmd_tx: mpsc::Sender<Command>, cancel: CancellationToken) {
    info!("engine ticker started");
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the loop below waits a full
    // interval before the first reconcile.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                match cmd_tx.try_send(Command::ReconcileTick) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("command channel full, skipping reconcile tick");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    info!("engine ticker stopped");
}

/// Bounds a std duration into chrono's signed range. Anything that
/// overflows (centuries) is effectively permanent anyway.
fn clamp_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

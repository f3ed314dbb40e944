//! Fixed-size pool of pre-provisioned sandboxes ("runners").
//!
//! A runner is handed to at most one caller at a time. Callers that find no
//! ready runner wait in a FIFO queue; a released runner goes straight to the
//! head of that queue. Every release restores the runner to its clean
//! checkpoint, and every checkout runs a liveness probe first, rebuilding the
//! sandbox when the probe fails.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use {
    thiserror::Error,
    tokio::{
        sync::{Mutex, oneshot},
        task::AbortHandle,
    },
    tracing::{debug, info, warn},
};

use crate::{
    backoff::Backoff,
    client::{ExecOptions, ExecOutput, SandboxClient, SandboxError, with_timeout},
    provision::{ProvisionError, ProvisionSettings, Provisioner},
};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no sandbox runner is ready yet; the pool is still warming up")]
    WarmingUp,

    #[error("sandbox pool is shutting down")]
    ShuttingDown,

    #[error("runner {runner} failed its health check and could not be rebuilt: {source}")]
    RebuildFailed {
        runner: String,
        #[source]
        source: ProvisionError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Provisioning,
    Ready,
    Locked,
    Unhealthy,
}

impl RunnerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Locked => "locked",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub ready: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Snapshot of one runner for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerStatus {
    pub name: String,
    pub state: RunnerState,
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub name_prefix: String,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub reap_orphans: bool,
    pub provision: ProvisionSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 3,
            name_prefix: "corral-runner".into(),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            reap_orphans: true,
            provision: ProvisionSettings::default(),
        }
    }
}

impl From<&corral_config::schema::PoolConfig> for PoolSettings {
    fn from(cfg: &corral_config::schema::PoolConfig) -> Self {
        Self {
            size: cfg.size,
            name_prefix: cfg.name_prefix.clone(),
            backoff_base: cfg.backoff_base(),
            backoff_max: cfg.backoff_max(),
            reap_orphans: cfg.reap_orphans,
            provision: ProvisionSettings::from(cfg),
        }
    }
}

struct Runner {
    name: String,
    state: RunnerState,
    checkpoint_id: Option<String>,
    provisioner_task: Option<AbortHandle>,
}

#[derive(Default)]
struct PoolState {
    runners: Vec<Runner>,
    waiters: VecDeque<oneshot::Sender<RunnerLease>>,
    shutting_down: bool,
    reaper_task: Option<AbortHandle>,
}

impl PoolState {
    /// At least one runner has been provisioned and is not being rebuilt in
    /// the background.
    fn in_service(&self) -> bool {
        self.runners
            .iter()
            .any(|r| r.state != RunnerState::Provisioning)
    }
}

struct PoolInner {
    provisioner: Provisioner,
    settings: PoolSettings,
    state: Mutex<PoolState>,
}

/// Shared handle to the runner pool. Cloning is cheap.
#[derive(Clone)]
pub struct RunnerPool {
    inner: Arc<PoolInner>,
}

impl RunnerPool {
    pub fn new(client: Arc<dyn SandboxClient>, settings: PoolSettings) -> Self {
        let runners = (0..settings.size)
            .map(|i| Runner {
                name: format!("{}-{i}", settings.name_prefix),
                state: RunnerState::Provisioning,
                checkpoint_id: None,
                provisioner_task: None,
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                provisioner: Provisioner::new(client, settings.provision.clone()),
                settings,
                state: Mutex::new(PoolState {
                    runners,
                    ..Default::default()
                }),
            }),
        }
    }

    pub fn client(&self) -> &Arc<dyn SandboxClient> {
        self.inner.provisioner.client()
    }

    pub fn runner_names(&self) -> Vec<String> {
        (0..self.inner.settings.size)
            .map(|i| format!("{}-{i}", self.inner.settings.name_prefix))
            .collect()
    }

    /// Start provisioning every runner in the background and return
    /// immediately. Each runner first tries to adopt an existing sandbox of
    /// the same name; failures are retried with capped exponential backoff.
    pub async fn initialize(&self) {
        let mut st = self.inner.state.lock().await;
        if st.shutting_down {
            return;
        }
        info!(
            size = self.inner.settings.size,
            prefix = %self.inner.settings.name_prefix,
            "initializing sandbox pool"
        );
        for index in 0..st.runners.len() {
            let runner = &st.runners[index];
            if runner.state == RunnerState::Provisioning && runner.provisioner_task.is_none() {
                self.spawn_provisioner(&mut st, index, true);
            }
        }
        if self.inner.settings.reap_orphans && st.reaper_task.is_none() {
            let pool = self.clone();
            let task = tokio::spawn(async move { pool.reap_orphans().await });
            st.reaper_task = Some(task.abort_handle());
        }
    }

    /// Acquire any ready runner. See [`RunnerPool::acquire_preferring`].
    pub async fn acquire(&self) -> Result<RunnerLease, PoolError> {
        self.acquire_preferring(None).await
    }

    /// Acquire a runner, taking `preferred` when it is ready, otherwise the
    /// first ready runner, otherwise waiting in FIFO order for a release.
    ///
    /// Fails fast with [`PoolError::WarmingUp`] while no runner has been
    /// provisioned. Dropping the returned future while queued gives up the
    /// place in line without leaking a runner.
    pub async fn acquire_preferring(
        &self,
        preferred: Option<&str>,
    ) -> Result<RunnerLease, PoolError> {
        let rx = {
            let mut st = self.inner.state.lock().await;
            if st.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            let ready = |r: &Runner| r.state == RunnerState::Ready;
            let index = preferred
                .and_then(|name| {
                    st.runners
                        .iter()
                        .position(|r| r.name == name && ready(r))
                })
                .or_else(|| st.runners.iter().position(ready));

            if let Some(index) = index {
                st.runners[index].state = RunnerState::Locked;
                let lease = RunnerLease::new(self.clone(), index, st.runners[index].name.clone());
                drop(st);
                return self.checkout(lease).await;
            }
            if !st.in_service() {
                return Err(PoolError::WarmingUp);
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(tx);
            debug!(waiting = st.waiters.len(), "all runners busy; queued");
            rx
        };

        match rx.await {
            Ok(lease) => self.checkout(lease).await,
            Err(_) => Err(PoolError::ShuttingDown),
        }
    }

    /// Probe a freshly locked runner, rebuilding it when the probe fails.
    async fn checkout(&self, mut lease: RunnerLease) -> Result<RunnerLease, PoolError> {
        lease.dirty = true;
        let provisioner = &self.inner.provisioner;

        let err = match provisioner.probe(&lease.name).await {
            Ok(()) => {
                debug!(runner = %lease.name, "runner acquired");
                return Ok(lease);
            },
            Err(e) => e,
        };
        warn!(runner = %lease.name, error = %err, "liveness probe failed");
        self.set_state(lease.index, RunnerState::Unhealthy).await;

        match provisioner.rebuild(&lease.name).await {
            Ok(checkpoint) => {
                let mut st = self.inner.state.lock().await;
                let runner = &mut st.runners[lease.index];
                runner.checkpoint_id = Some(checkpoint);
                runner.state = RunnerState::Locked;
                Ok(lease)
            },
            Err(source) => {
                lease.released = true;
                let mut st = self.inner.state.lock().await;
                st.runners[lease.index].state = RunnerState::Provisioning;
                if !st.shutting_down {
                    self.spawn_provisioner(&mut st, lease.index, false);
                }
                Err(PoolError::RebuildFailed {
                    runner: lease.name.clone(),
                    source,
                })
            },
        }
    }

    /// Return a runner: restore the clean checkpoint when it was used,
    /// rebuilding on failure, then hand it to the next waiter or mark it
    /// ready.
    async fn release_runner(&self, index: usize, dirty: bool) {
        let (name, checkpoint) = {
            let st = self.inner.state.lock().await;
            let runner = &st.runners[index];
            (runner.name.clone(), runner.checkpoint_id.clone())
        };
        let provisioner = &self.inner.provisioner;

        let restored = if !dirty {
            true
        } else if let Some(checkpoint) = checkpoint.as_deref() {
            match provisioner.restore(&name, checkpoint).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(runner = %name, error = %e, "checkpoint restore failed");
                    false
                },
            }
        } else {
            false
        };

        if !restored {
            self.set_state(index, RunnerState::Unhealthy).await;
            match provisioner.rebuild(&name).await {
                Ok(checkpoint) => {
                    let mut st = self.inner.state.lock().await;
                    st.runners[index].checkpoint_id = Some(checkpoint);
                },
                Err(e) => {
                    warn!(runner = %name, error = %e, "rebuild after release failed; retrying in background");
                    let mut st = self.inner.state.lock().await;
                    st.runners[index].state = RunnerState::Provisioning;
                    if !st.shutting_down {
                        self.spawn_provisioner(&mut st, index, false);
                    }
                    return;
                },
            }
        }

        let mut st = self.inner.state.lock().await;
        self.make_available(&mut st, index);
        debug!(runner = %name, "runner released");
    }

    /// Give runner `index` to the oldest live waiter, or mark it ready.
    fn make_available(&self, st: &mut PoolState, index: usize) {
        let name = st.runners[index].name.clone();
        while let Some(waiter) = st.waiters.pop_front() {
            st.runners[index].state = RunnerState::Locked;
            match waiter.send(RunnerLease::new(self.clone(), index, name.clone())) {
                Ok(()) => return,
                // The waiter gave up; try the next one.
                Err(mut lease) => lease.released = true,
            }
        }
        st.runners[index].state = RunnerState::Ready;
    }

    async fn set_state(&self, index: usize, state: RunnerState) {
        self.inner.state.lock().await.runners[index].state = state;
    }

    fn spawn_provisioner(&self, st: &mut PoolState, index: usize, try_reuse: bool) {
        let pool = self.clone();
        let task = tokio::spawn(async move { pool.provision_until_ready(index, try_reuse).await });
        if let Some(previous) = st.runners[index].provisioner_task.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    async fn provision_until_ready(&self, index: usize, mut try_reuse: bool) {
        let name = self.inner.state.lock().await.runners[index].name.clone();
        let provisioner = &self.inner.provisioner;
        let mut backoff = Backoff::new(
            self.inner.settings.backoff_base,
            self.inner.settings.backoff_max,
        );

        loop {
            let reused = if try_reuse {
                try_reuse = false;
                match provisioner.reuse_existing(&name).await {
                    Ok(found) => found,
                    Err(e) => {
                        debug!(runner = %name, error = %e, "existing sandbox not reusable");
                        None
                    },
                }
            } else {
                None
            };
            let result = match reused {
                Some(checkpoint) => Ok(checkpoint),
                None => provisioner.provision_fresh(&name).await,
            };

            match result {
                Ok(checkpoint) => {
                    let mut st = self.inner.state.lock().await;
                    let runner = &mut st.runners[index];
                    runner.checkpoint_id = Some(checkpoint);
                    runner.provisioner_task = None;
                    if st.shutting_down {
                        return;
                    }
                    self.make_available(&mut st, index);
                    info!(runner = %name, attempts = backoff.attempts() + 1, "runner ready");
                    return;
                },
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        runner = %name,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "provisioning failed"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// Delete sandboxes under the pool's prefix that are not pool slots.
    async fn reap_orphans(&self) {
        let prefix = format!("{}-", self.inner.settings.name_prefix);
        let slots = self.runner_names();
        let client = self.client();
        let timeout = self.inner.provisioner.call_timeout();

        let existing = match with_timeout("list", timeout, client.list(&prefix)).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "could not list sandboxes for orphan cleanup");
                return;
            },
        };
        for sandbox in existing {
            if !sandbox.name.starts_with(&prefix) || slots.contains(&sandbox.name) {
                continue;
            }
            match with_timeout("delete", timeout, client.delete(&sandbox.name)).await {
                Ok(()) => info!(sandbox = %sandbox.name, "removed orphaned sandbox"),
                Err(e) if e.is_not_found() => {},
                Err(e) => warn!(sandbox = %sandbox.name, error = %e, "failed to remove orphan"),
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let st = self.inner.state.lock().await;
        let ready = st
            .runners
            .iter()
            .filter(|r| matches!(r.state, RunnerState::Ready | RunnerState::Locked))
            .count();
        let available = st
            .runners
            .iter()
            .filter(|r| r.state == RunnerState::Ready)
            .count();
        PoolStats {
            total: st.runners.len(),
            ready,
            available,
            waiting: st.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }

    pub async fn runners(&self) -> Vec<RunnerStatus> {
        let st = self.inner.state.lock().await;
        st.runners
            .iter()
            .map(|r| RunnerStatus {
                name: r.name.clone(),
                state: r.state,
                checkpoint_id: r.checkpoint_id.clone(),
            })
            .collect()
    }

    /// Stop background provisioning and fail every queued acquirer with
    /// [`PoolError::ShuttingDown`]. Leased runners stay valid until released.
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        st.shutting_down = true;
        for runner in &mut st.runners {
            if let Some(task) = runner.provisioner_task.take() {
                task.abort();
            }
        }
        if let Some(task) = st.reaper_task.take() {
            task.abort();
        }
        let dropped = st.waiters.len();
        st.waiters.clear();
        info!(dropped_waiters = dropped, "sandbox pool shut down");
    }
}

/// Exclusive use of one runner. Release it with [`RunnerLease::release`];
/// a lease that is dropped instead releases in a background task.
pub struct RunnerLease {
    pool: RunnerPool,
    index: usize,
    name: String,
    /// Whether the caller may have changed the sandbox since the last restore.
    dirty: bool,
    released: bool,
}

impl RunnerLease {
    fn new(pool: RunnerPool, index: usize, name: String) -> Self {
        Self {
            pool,
            index,
            name,
            dirty: false,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a command inside the leased sandbox under `opts.timeout`.
    pub async fn exec(&self, argv: &[String], opts: &ExecOptions) -> Result<ExecOutput, SandboxError> {
        with_timeout(
            "exec",
            opts.timeout,
            self.pool.client().exec(&self.name, argv, opts),
        )
        .await
    }

    /// Restore the runner and make it available again.
    pub async fn release(mut self) {
        self.released = true;
        self.pool.release_runner(self.index, self.dirty).await;
    }
}

impl std::fmt::Debug for RunnerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerLease")
            .field("name", &self.name)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl Drop for RunnerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let (index, dirty) = (self.index, self.dirty);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if dirty {
                    warn!(runner = %self.name, "lease dropped without release; releasing in background");
                }
                handle.spawn(async move { pool.release_runner(index, dirty).await });
            },
            Err(_) => warn!(runner = %self.name, "lease dropped outside a runtime; runner stays locked"),
        }
    }
}

//! Task-claiming worker.
//!
//! A worker process polls the task queue for event tasks, dispatches
//! them to handlers, and drives workflow resumption on completion or
//! failure. Multiple workers run concurrently across processes,
//! coordinated only through the store's atomic `claim_task`.
//!
//! Lifecycle: register a server record → heartbeat daemon → poll loop
//! claiming up to the free pool capacity → per-task slot (dispatch →
//! `continue_step` → `resume` → terminal task state) → cooperative
//! shutdown draining in-flight slots with a bounded wait.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use weft_program::{find_workflow, normalize_program};

use crate::dispatch::{HandlerDispatcher, InMemoryDispatcher, Payload};
use crate::error::RuntimeError;
use crate::evaluator::Evaluator;
use crate::ids;
use crate::persistence::{
    ServerRecord, ServerState, TaskError, TaskRecord, TaskState, WorkflowStore,
};
use crate::states::StepState;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub service_name: String,
    pub server_group: String,
    pub server_name: String,

    /// Queue partition this worker claims from.
    pub task_list: String,

    /// Delay between poll cycles.
    pub poll_interval: Duration,

    /// Bound on concurrently executing task slots.
    pub max_concurrent: usize,

    /// Server-record ping cadence.
    pub heartbeat_interval: Duration,

    /// How often the claimable-name set is rebuilt from persisted
    /// registrations (registry mode).
    pub registry_refresh_interval: Duration,

    /// Glob patterns filtering registry-mode names; empty means all.
    pub topics: Vec<String>,

    /// Claim names from persisted handler registrations in addition to
    /// directly registered handlers.
    pub registry_mode: bool,

    /// Bounded wait for in-flight slots on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_name: "weft-worker".to_string(),
            server_group: "default".to_string(),
            server_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            task_list: "default".to_string(),
            poll_interval: Duration::from_secs(2),
            max_concurrent: 5,
            heartbeat_interval: Duration::from_secs(10),
            registry_refresh_interval: Duration::from_secs(30),
            topics: Vec::new(),
            registry_mode: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_task_list(mut self, task_list: impl Into<String>) -> Self {
        self.task_list = task_list.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_registry_mode(mut self, enabled: bool) -> Self {
        self.registry_mode = enabled;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

struct Shared {
    store: Arc<dyn WorkflowStore>,
    evaluator: Arc<Evaluator>,
    local: InMemoryDispatcher,
    external: RwLock<Option<Arc<dyn HandlerDispatcher>>>,
    config: WorkerConfig,
    server_id: String,

    /// Per-workflow resume serialization; acquired non-blockingly.
    resume_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,

    /// workflow id → (workflow IR, program IR).
    ast_cache: DashMap<String, (Value, Option<Value>)>,

    /// Registry-mode claimable names.
    registry_names: RwLock<Vec<String>>,
    last_refresh: Mutex<Option<Instant>>,
}

/// The polling worker.
pub struct Worker {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    slots: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        evaluator: Arc<Evaluator>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            shared: Arc::new(Shared {
                store,
                evaluator,
                local: InMemoryDispatcher::new(),
                external: RwLock::new(None),
                config,
                server_id: ids::server_id(),
                resume_locks: DashMap::new(),
                ast_cache: DashMap::new(),
                registry_names: RwLock::new(Vec::new()),
                last_refresh: Mutex::new(None),
            }),
            shutdown_tx,
            shutdown_rx,
            slots,
        }
    }

    /// Chain an additional dispatcher (registry, subprocess, composite)
    /// consulted after directly registered handlers.
    pub fn with_dispatcher(self, dispatcher: Arc<dyn HandlerDispatcher>) -> Self {
        *self.shared.external.write() = Some(dispatcher);
        self
    }

    /// Register an async handler for a qualified facet name. Raise an
    /// error from the handler to signal failure.
    pub fn register<F, Fut>(&self, facet_name: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, String>> + Send + 'static,
    {
        self.shared.local.register(facet_name, handler);
    }

    /// The worker's server identity.
    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    /// Names this worker will claim, including registry-mode names as of
    /// the last refresh.
    pub async fn registered_names(&self) -> Vec<String> {
        self.shared.maybe_refresh_registry().await;
        self.shared.claimable_names()
    }

    /// Pre-seed the AST cache for a workflow.
    pub fn cache_workflow_ast(
        &self,
        workflow_id: &str,
        workflow_ir: Value,
        program_ir: Option<Value>,
    ) {
        self.shared
            .ast_cache
            .insert(workflow_id.to_string(), (workflow_ir, program_ir));
    }

    /// Merge partial return values into a paused step before its final
    /// completion (streaming handlers).
    pub async fn update_step(
        &self,
        step_id: &str,
        partial: &Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        let mut step = self
            .shared
            .store
            .get_step(step_id)
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))?
            .ok_or_else(|| RuntimeError::StepNotFound(step_id.to_string()))?;
        step.reset_transition();

        if step.state() != StepState::EventTransmit {
            return Err(RuntimeError::InvalidStepState {
                step_id: step_id.to_string(),
                state: step.state(),
            });
        }

        step.attributes.set_returns_json(partial);
        self.shared
            .store
            .save_step(&step)
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))
    }

    /// Start the worker (blocking): register the server, run heartbeat
    /// and poll loops until [`stop`](Self::stop), then drain and
    /// deregister.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.shared.maybe_refresh_registry().await;
        self.shared.register_server().await?;

        info!(
            server_id = %self.shared.server_id,
            service = %self.shared.config.service_name,
            handlers = ?self.shared.claimable_names(),
            "worker started"
        );

        let heartbeat = self.spawn_heartbeat();

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if let Err(e) = self.poll_cycle().await {
                error!(error = %e, "poll cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.shared.config.poll_interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        heartbeat.abort();
        self.drain().await;
        self.shared.deregister_server().await?;

        info!(server_id = %self.shared.server_id, "worker stopped");
        Ok(())
    }

    /// Signal the worker to stop claiming and shut down.
    pub fn stop(&self) {
        debug!(server_id = %self.shared.server_id, "worker stopping");
        let _ = self.shutdown_tx.send(true);
    }

    /// One synchronous poll cycle for tests: claims and processes tasks
    /// sequentially, without the slot pool. Returns the number of tasks
    /// dispatched.
    pub async fn poll_once(&self) -> usize {
        self.shared.maybe_refresh_registry().await;
        let names = self.shared.claimable_names();
        if names.is_empty() {
            return 0;
        }

        let mut dispatched = 0;
        let mut capacity = self.shared.config.max_concurrent;
        while capacity > 0 {
            let task = match self
                .shared
                .store
                .claim_task(&names, &self.shared.config.task_list, &self.shared.server_id)
                .await
            {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "claim failed");
                    break;
                }
            };
            self.shared.process_task(task).await;
            capacity -= 1;
            dispatched += 1;
        }
        dispatched
    }

    async fn poll_cycle(&self) -> Result<(), RuntimeError> {
        self.shared.maybe_refresh_registry().await;
        let names = self.shared.claimable_names();
        if names.is_empty() {
            return Ok(());
        }

        while self.slots.available_permits() > 0 {
            let task = match self
                .shared
                .store
                .claim_task(&names, &self.shared.config.task_list, &self.shared.server_id)
                .await
            {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => return Err(RuntimeError::Store(e.to_string())),
            };

            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                // Raced to zero capacity; the claim stays ours, run it
                // inline rather than abandon it.
                self.shared.process_task(task).await;
                continue;
            };

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.process_task(task).await;
                drop(permit);
            });
        }
        Ok(())
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = shared
                            .store
                            .update_server_ping(&shared.server_id, Utc::now())
                            .await
                        {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Wait for in-flight slots to finish, bounded by the shutdown
    /// timeout.
    async fn drain(&self) {
        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        loop {
            if self.slots.available_permits() == self.shared.config.max_concurrent {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    in_flight =
                        self.shared.config.max_concurrent - self.slots.available_permits(),
                    "shutdown timeout reached with tasks in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Shared {
    fn claimable_names(&self) -> Vec<String> {
        let mut names = self.local.registered_names();
        if self.config.registry_mode {
            for name in self.registry_names.read().iter() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names.sort();
        names
    }

    async fn maybe_refresh_registry(&self) {
        if !self.config.registry_mode {
            return;
        }
        {
            let last = self.last_refresh.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.config.registry_refresh_interval {
                    return;
                }
            }
        }

        match self.store.list_handler_registrations().await {
            Ok(registrations) => {
                let names: Vec<String> = registrations
                    .into_iter()
                    .map(|r| r.facet_name)
                    .filter(|name| self.matches_topics(name))
                    .collect();
                *self.registry_names.write() = names;
                *self.last_refresh.lock() = Some(Instant::now());
            }
            Err(e) => warn!(error = %e, "registry refresh failed"),
        }
    }

    fn matches_topics(&self, facet_name: &str) -> bool {
        if self.config.topics.is_empty() {
            return true;
        }
        self.config
            .topics
            .iter()
            .any(|pattern| glob_match(pattern, facet_name))
    }

    async fn register_server(&self) -> Result<(), RuntimeError> {
        let now = Utc::now();
        let server = ServerRecord {
            uuid: self.server_id.clone(),
            server_group: self.config.server_group.clone(),
            service_name: self.config.service_name.clone(),
            server_name: self.config.server_name.clone(),
            server_ips: Vec::new(),
            start_time: now,
            ping_time: now,
            topics: if self.config.topics.is_empty() {
                self.claimable_names()
            } else {
                self.config.topics.clone()
            },
            handlers: self.claimable_names(),
            state: ServerState::Running,
        };
        self.store
            .save_server(&server)
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))
    }

    async fn deregister_server(&self) -> Result<(), RuntimeError> {
        let server = self
            .store
            .get_server(&self.server_id)
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        if let Some(mut server) = server {
            server.state = ServerState::Shutdown;
            server.ping_time = Utc::now();
            self.store
                .save_server(&server)
                .await
                .map_err(|e| RuntimeError::Store(e.to_string()))?;
        }
        Ok(())
    }

    /// One claimed task end to end: dispatch, continue the step, resume
    /// the workflow, record the terminal task state. Handler failures
    /// never propagate past this slot.
    async fn process_task(&self, mut task: TaskRecord) {
        let mut payload = task.data.clone();
        payload.insert(
            crate::dispatch::subprocess::STEP_ID_KEY.to_string(),
            Value::String(task.step_id.clone()),
        );

        let result = self.dispatch(&task.name, payload).await;

        match result {
            Ok(returns) => {
                if let Err(e) = self.evaluator.continue_step(&task.step_id, &returns).await {
                    error!(step_id = %task.step_id, error = %e, "continue_step failed");
                    self.finish_task_failed(&mut task, &e.to_string()).await;
                    return;
                }

                self.resume_workflow(&task.workflow_id).await;

                task.state = TaskState::Completed;
                task.updated = Utc::now();
                if let Err(e) = self.store.save_task(&task).await {
                    error!(task_id = %task.uuid, error = %e, "could not record task completion");
                }
                info!(task_id = %task.uuid, name = %task.name, step_id = %task.step_id, "task completed");
            }
            Err(message) => {
                if let Err(e) = self.evaluator.fail_step(&task.step_id, &message).await {
                    debug!(step_id = %task.step_id, error = %e, "could not fail step");
                }
                self.finish_task_failed(&mut task, &message).await;
                warn!(task_id = %task.uuid, name = %task.name, %message, "task failed");
            }
        }
    }

    async fn dispatch(&self, name: &str, payload: Payload) -> Result<Payload, String> {
        if self.local.can_dispatch(name).await {
            return self
                .local
                .dispatch(name, payload)
                .await
                .map_err(|e| e.to_string());
        }
        let external = self.external.read().clone();
        if let Some(external) = external {
            if external.can_dispatch(name).await {
                return external
                    .dispatch(name, payload)
                    .await
                    .map_err(|e| e.to_string());
            }
        }
        Err(format!("no handler for event task '{name}'"))
    }

    async fn finish_task_failed(&self, task: &mut TaskRecord, message: &str) {
        task.state = TaskState::Failed;
        task.error = Some(TaskError {
            message: message.to_string(),
        });
        task.updated = Utc::now();
        if let Err(e) = self.store.save_task(task).await {
            error!(task_id = %task.uuid, error = %e, "could not record task failure");
        }
    }

    /// Resume a paused workflow, serialized per workflow within this
    /// worker. If a resume is already in flight the call is skipped —
    /// the holder's next iteration observes the newly continued step.
    async fn resume_workflow(&self, workflow_id: &str) {
        let lock = self
            .resume_locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let Ok(_guard) = lock.try_lock() else {
            debug!(%workflow_id, "resume already in progress, skipping");
            return;
        };

        let Some((workflow_ir, program_ir)) = self.load_workflow_ast(workflow_id).await else {
            warn!(%workflow_id, "no compiled workflow available, skipping resume");
            return;
        };

        let external = self.external.read().clone();
        match self
            .evaluator
            .resume(
                workflow_id,
                &workflow_ir,
                program_ir.as_ref(),
                external.as_deref(),
            )
            .await
        {
            Ok(result) => {
                debug!(%workflow_id, status = ?result.status, "resume finished");
            }
            Err(e) => {
                error!(%workflow_id, error = %e, "resume failed");
            }
        }
    }

    /// AST cache with hydration: reparse the persisted flow source and
    /// locate the workflow by name.
    async fn load_workflow_ast(&self, workflow_id: &str) -> Option<(Value, Option<Value>)> {
        if let Some(cached) = self.ast_cache.get(workflow_id) {
            return Some(cached.clone());
        }

        let workflow = self.store.get_workflow(workflow_id).await.ok().flatten()?;
        let flow = self.store.get_flow(&workflow.flow_id).await.ok().flatten()?;

        let program: Value = match serde_json::from_str(&flow.source) {
            Ok(program) => program,
            Err(e) => {
                warn!(%workflow_id, error = %e, "persisted flow source does not parse");
                return None;
            }
        };
        let program = normalize_program(&program);
        let workflow_ir = find_workflow(&program, &workflow.name)?.clone();

        let entry = (workflow_ir, Some(program));
        self.ast_cache
            .insert(workflow_id.to_string(), entry.clone());
        Some(entry)
    }
}

/// Minimal glob matching: `*` matches any run, `?` matches one
/// character.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

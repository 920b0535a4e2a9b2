//! Launch orchestration
//!
//! The orchestrator owns the one rule everything else depends on: at most
//! one backend occupies the GPU at a time. Every switch runs the same
//! sequence under the exclusivity lock: evict whatever is running, spawn
//! the new backend detached with its output captured to a log file, then
//! poll it to readiness. A newer switch request preempts any in-flight
//! attempt at any phase via its cancellation token.
//!
//! Launch failures are terminal states, not panics: they fold into a
//! [`LaunchResult`] carrying the message and captured log path, and the
//! same information goes out on the event bus.

use crate::client::{HttpClient, get_with_timeout};
use crate::config::{BackendKind, Config, LaunchSpec, RecipeConfig, TimeoutConfig};
use crate::errors::SwitchError;
use crate::events::{DEFAULT_CHANNEL, EventBus};
use crate::process::{ProcessHandle, ProcessLister, ProcessManager};
use crate::sync::FairMutex;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health probe timeout per attempt; well under the poll interval.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Log lines matching any of these are treated as unrecoverable: the
/// attempt fails immediately instead of burning the readiness ceiling.
const FATAL_LOG_PATTERNS: &[&str] = &[
    "CUDA out of memory",
    "torch.OutOfMemoryError",
    "EngineDeadError",
    "Engine core initialization failed",
    "error loading model",
    "failed to load model",
    "Address already in use",
];

/// Phase of a launch attempt, published with every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchPhase {
    Idle,
    Evicting,
    Launching,
    WaitingForReady,
    Ready,
    Error,
    Cancelled,
}

/// Terminal outcome of one switch attempt.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchResult {
    pub success: bool,
    pub recipe: String,
    pub pid: Option<u32>,
    pub message: String,
    pub log_file: Option<PathBuf>,
}

/// Spawning sits behind a trait so orchestration can be exercised without
/// forking real inference servers.
pub trait BackendSpawner: Send + Sync {
    /// Start the backend detached, output redirected to `log_file`.
    /// Returns the child pid.
    fn spawn(
        &self,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        log_file: &Path,
    ) -> Result<u32, String>;
}

/// Production spawner: the child gets its own process group so it outlives
/// the control plane and can be evicted as a tree.
#[derive(Debug, Default)]
pub struct DetachedSpawner;

impl BackendSpawner for DetachedSpawner {
    fn spawn(
        &self,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        log_file: &Path,
    ) -> Result<u32, String> {
        let out = std::fs::File::create(log_file)
            .map_err(|e| format!("failed to create log file {}: {e}", log_file.display()))?;
        let err = out
            .try_clone()
            .map_err(|e| format!("failed to clone log handle: {e}"))?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| e.to_string())?;
        Ok(child.id())
    }
}

/// Emits monotone launch-progress events: a later report can never show
/// less progress than an earlier one.
struct ProgressReporter {
    events: Arc<EventBus>,
    recipe: String,
    floor: f64,
}

impl ProgressReporter {
    fn new(events: Arc<EventBus>, recipe: &str) -> Self {
        Self {
            events,
            recipe: recipe.to_string(),
            floor: 0.0,
        }
    }

    fn report(&mut self, phase: LaunchPhase, progress: f64, message: &str) {
        self.floor = self.floor.max(progress);
        self.events.publish(
            DEFAULT_CHANNEL,
            "launch_progress",
            json!({
                "recipe": self.recipe,
                "state": phase,
                "progress": self.floor,
                "message": message,
            }),
        );
    }
}

/// Removes an attempt's registry entry when the attempt future completes
/// or is dropped mid-await.
struct AttemptGuard<'a> {
    attempts: &'a DashMap<String, CancellationToken>,
    key: String,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.attempts.remove(&self.key);
    }
}

/// The control plane's launch state machine.
pub struct Orchestrator<C> {
    recipes: HashMap<String, RecipeConfig>,
    host: String,
    managed_port: u16,
    log_dir: PathBuf,
    timeouts: TimeoutConfig,
    client: C,
    processes: ProcessManager<C>,
    spawner: Box<dyn BackendSpawner>,
    /// Serializes the evict/launch critical section across attempts
    switch_lock: FairMutex,
    /// In-flight attempts by attempt key; a new explicit switch cancels all
    attempts: DashMap<String, CancellationToken>,
    attempt_seq: AtomicU64,
    events: Arc<EventBus>,
}

impl<C: HttpClient + Clone> Orchestrator<C> {
    pub fn new(
        config: &Config,
        client: C,
        lister: Box<dyn ProcessLister>,
        spawner: Box<dyn BackendSpawner>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            recipes: config.recipes.clone(),
            host: config.host.clone(),
            managed_port: config.managed_port,
            log_dir: config.log_dir.clone(),
            timeouts: config.timeouts.clone(),
            client: client.clone(),
            processes: ProcessManager::new(lister, client),
            spawner,
            switch_lock: FairMutex::new(),
            attempts: DashMap::new(),
            attempt_seq: AtomicU64::new(1),
            events,
        }
    }

    /// Shrink eviction timing (tests only care about ordering, not grace).
    pub fn with_evict_timing(mut self, grace_wait: Duration, settle_delay: Duration) -> Self {
        self.processes = self.processes.with_timing(grace_wait, settle_delay);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn recipe_ids(&self) -> Vec<String> {
        self.recipes.keys().cloned().collect()
    }

    pub fn recipe(&self, id: &str) -> Option<&RecipeConfig> {
        self.recipes.get(id)
    }

    /// The backend currently occupying the GPU, derived by inspection.
    pub async fn current_process(&self) -> Option<ProcessHandle> {
        self.processes.find_inference_process(self.managed_port).await
    }

    /// Explicit switch: preempts every in-flight attempt, then runs the
    /// evict/launch/wait sequence for `recipe_id`.
    pub async fn switch_to(&self, recipe_id: &str) -> LaunchResult {
        self.preempt_all(recipe_id);
        self.run_attempt(recipe_id).await
    }

    /// Implicit switch used by the request path: makes sure the backend
    /// serving `model` is up, launching its recipe if needed. Does not
    /// preempt anything; an explicit switch can still preempt it.
    pub async fn ensure_model(&self, model: &str) -> Result<(), SwitchError> {
        if let Some(handle) = self.current_process().await {
            if handle.model_path == model
                || handle.served_model_name.as_deref() == Some(model)
            {
                return Ok(());
            }
        }

        let recipe_id = self
            .recipes
            .iter()
            .find(|(id, recipe)| {
                *id == model
                    || recipe.model_path == model
                    || recipe.served_model_name.as_deref() == Some(model)
            })
            .map(|(id, _)| id.clone())
            .ok_or_else(|| SwitchError::RecipeNotFound(model.to_string()))?;

        info!(model, recipe = %recipe_id, "requested model not running; switching");
        self.run_registered(&recipe_id).await?;
        Ok(())
    }

    /// Cancel in-flight attempts. With a recipe id only that recipe's
    /// attempts are cancelled; without one, all of them. When the named
    /// recipe has no tracked attempt but its backend is the one on the GPU,
    /// the backend is evicted instead. Returns how many were acted on.
    pub async fn cancel_launch(&self, recipe_id: Option<&str>) -> usize {
        let mut cancelled = 0;
        for entry in self.attempts.iter() {
            let matches = match recipe_id {
                Some(id) => entry.key().split('#').next() == Some(id),
                None => true,
            };
            if matches {
                entry.value().cancel();
                cancelled += 1;
            }
        }

        if cancelled == 0 {
            if let Some(recipe) = recipe_id.and_then(|id| self.recipes.get(id)) {
                if let Some(handle) = self.current_process().await {
                    let matches = handle.model_path == recipe.model_path
                        || (handle.served_model_name.is_some()
                            && handle.served_model_name == recipe.served_model_name);
                    if matches {
                        info!(
                            recipe = ?recipe_id,
                            pid = handle.pid,
                            "no tracked attempt; evicting running backend"
                        );
                        self.evict(false).await;
                        cancelled = 1;
                    }
                }
            }
        }

        info!(recipe = ?recipe_id, cancelled, "cancel requested");
        cancelled
    }

    /// Evict the current backend without launching a replacement.
    /// Returns the evicted root pid, if a backend was running.
    pub async fn evict(&self, force: bool) -> Option<u32> {
        let _permit = self.switch_lock.acquire().await;
        let handle = self.current_process().await?;
        info!(pid = handle.pid, backend = %handle.backend, force, "evicting backend");
        self.processes.kill_process_tree(handle.pid, force).await;
        self.events.publish(
            DEFAULT_CHANNEL,
            "evicted",
            json!({ "pid": handle.pid, "model": handle.model_path }),
        );
        Some(handle.pid)
    }

    fn preempt_all(&self, superseded_by: &str) {
        for entry in self.attempts.iter() {
            warn!(attempt = %entry.key(), by = superseded_by, "preempting in-flight launch");
            entry.value().cancel();
            self.events.publish(
                DEFAULT_CHANNEL,
                "preempted",
                json!({ "attempt": entry.key(), "superseded_by": superseded_by }),
            );
        }
    }

    /// One registered launch attempt, folded to its terminal state.
    async fn run_attempt(&self, recipe_id: &str) -> LaunchResult {
        match self.run_registered(recipe_id).await {
            Ok(pid) => LaunchResult {
                success: true,
                recipe: recipe_id.to_string(),
                pid: Some(pid),
                message: "ready".to_string(),
                log_file: Some(self.log_file_path(recipe_id)),
            },
            Err(err) => LaunchResult {
                success: false,
                recipe: recipe_id.to_string(),
                pid: None,
                log_file: err.log_file().cloned(),
                message: err.to_string(),
            },
        }
    }

    /// Run one attempt under a registry entry so it can be preempted or
    /// cancelled. The entry is removed on every exit path, including the
    /// caller dropping the future mid-await.
    async fn run_registered(&self, recipe_id: &str) -> Result<u32, SwitchError> {
        let seq = self.attempt_seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("{recipe_id}#{seq}");
        let cancel = CancellationToken::new();
        self.attempts.insert(key.clone(), cancel.clone());
        let _cleanup = AttemptGuard {
            attempts: &self.attempts,
            key,
        };

        let mut reporter = ProgressReporter::new(Arc::clone(&self.events), recipe_id);
        match self.run_switch(recipe_id, &cancel, &mut reporter).await {
            Ok(pid) => Ok(pid),
            Err(err) => {
                let phase = match err {
                    SwitchError::Cancelled(_) => LaunchPhase::Cancelled,
                    _ => LaunchPhase::Error,
                };
                let message = err.to_string();
                error!(recipe = recipe_id, %message, "launch attempt failed");
                reporter.report(phase, 1.0, &message);
                Err(err)
            }
        }
    }

    async fn run_switch(
        &self,
        recipe_id: &str,
        cancel: &CancellationToken,
        reporter: &mut ProgressReporter,
    ) -> Result<u32, SwitchError> {
        let recipe = self
            .recipes
            .get(recipe_id)
            .ok_or_else(|| SwitchError::RecipeNotFound(recipe_id.to_string()))?;
        let spec = LaunchSpec::from_recipe(recipe_id, recipe, &self.host, self.managed_port);

        // Exclusivity lock with a bounded wait. A holder that won't yield
        // within the window is assumed wedged: force-evict out from under
        // it (its liveness check will fail it fast) and take the lock
        // unconditionally.
        let lock_timeout = Duration::from_secs(self.timeouts.lock_timeout_secs);
        let permit = match self.switch_lock.acquire_timeout(lock_timeout).await {
            Some(permit) => permit,
            None => {
                warn!(recipe = recipe_id, "switch lock busy past timeout; force-evicting");
                if let Some(handle) = self.current_process().await {
                    self.processes.kill_process_tree(handle.pid, true).await;
                }
                tokio::select! {
                    permit = self.switch_lock.acquire() => permit,
                    _ = cancel.cancelled() => {
                        return Err(SwitchError::Cancelled(recipe_id.to_string()));
                    }
                }
            }
        };
        let _permit = permit;

        if cancel.is_cancelled() {
            return Err(SwitchError::Cancelled(recipe_id.to_string()));
        }

        // Phase: evict whatever currently holds the GPU.
        reporter.report(LaunchPhase::Evicting, 0.05, "evicting current backend");
        if let Some(handle) = self.current_process().await {
            info!(recipe = recipe_id, evicting_pid = handle.pid, "evicting previous backend");
            self.processes.kill_process_tree(handle.pid, false).await;
        }

        if cancel.is_cancelled() {
            return Err(SwitchError::Cancelled(recipe_id.to_string()));
        }

        // Phase: spawn.
        reporter.report(LaunchPhase::Launching, 0.1, "spawning backend");
        let log_file = self.log_file_path(recipe_id);
        if let Some(parent) = log_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SwitchError::SpawnFailure {
                    recipe: recipe_id.to_string(),
                    reason: format!("failed to create log dir: {e}"),
                })?;
        }

        let envs = spawn_env(&spec);
        let pid = self
            .spawner
            .spawn(spec.program(), &spec.command_args(), &envs, &log_file)
            .map_err(|reason| SwitchError::SpawnFailure {
                recipe: recipe_id.to_string(),
                reason,
            })?;
        info!(recipe = recipe_id, pid, log = %log_file.display(), "backend spawned");

        // Immediate-exit check after a short grace: a missing binary or a
        // bad flag dies in milliseconds, well before the first poll.
        let grace = Duration::from_millis(self.timeouts.spawn_grace_ms);
        tokio::select! {
            _ = tokio::time::sleep(grace) => {}
            _ = cancel.cancelled() => {
                self.processes.kill_process_tree(pid, true).await;
                return Err(SwitchError::Cancelled(recipe_id.to_string()));
            }
        }
        if !self.processes.is_alive(pid) {
            let excerpt = log_tail(&log_file).await;
            return Err(SwitchError::SpawnFailure {
                recipe: recipe_id.to_string(),
                reason: format!("backend exited immediately: {excerpt}"),
            });
        }

        // Phase: poll to readiness.
        self.wait_for_ready(&spec, pid, &log_file, cancel, reporter)
            .await?;

        reporter.report(LaunchPhase::Ready, 1.0, "backend ready");
        info!(recipe = recipe_id, pid, "backend ready");
        Ok(pid)
    }

    async fn wait_for_ready(
        &self,
        spec: &LaunchSpec,
        pid: u32,
        log_file: &Path,
        cancel: &CancellationToken,
        reporter: &mut ProgressReporter,
    ) -> Result<(), SwitchError> {
        let recipe_id = spec.recipe_id.clone();
        let ceiling = Duration::from_secs(self.timeouts.ready_ceiling_secs);
        let poll_interval = Duration::from_secs(self.timeouts.poll_interval_secs);
        let started = Instant::now();
        let deadline = started + ceiling;
        let health_url = health_url(spec, &self.host);
        let mut log_offset = 0usize;

        loop {
            if cancel.is_cancelled() {
                self.processes.kill_process_tree(pid, true).await;
                return Err(SwitchError::Cancelled(recipe_id));
            }

            // Fatal log lines fail the attempt without waiting out the
            // ceiling.
            if let Some(excerpt) = scan_new_lines(log_file, &mut log_offset).await {
                error!(recipe = %recipe_id, %excerpt, "fatal pattern in backend log");
                self.processes.kill_process_tree(pid, true).await;
                return Err(SwitchError::FatalBackendError {
                    recipe: recipe_id,
                    excerpt,
                    log_file: log_file.to_path_buf(),
                });
            }

            if !self.processes.is_alive(pid) {
                let excerpt = log_tail(log_file).await;
                return Err(SwitchError::FatalBackendError {
                    recipe: recipe_id,
                    excerpt,
                    log_file: log_file.to_path_buf(),
                });
            }

            match get_with_timeout(&self.client, &health_url, HEALTH_PROBE_TIMEOUT).await {
                Ok((status, _)) if (200..300).contains(&status) => return Ok(()),
                Ok((status, _)) => {
                    debug!(recipe = %recipe_id, status, "health probe not ready")
                }
                Err(reason) => debug!(recipe = %recipe_id, %reason, "health probe failed"),
            }

            if Instant::now() >= deadline {
                self.processes.kill_process_tree(pid, true).await;
                return Err(SwitchError::ReadinessTimeout {
                    recipe: recipe_id,
                    ceiling_secs: self.timeouts.ready_ceiling_secs,
                    log_file: log_file.to_path_buf(),
                });
            }

            // Time-based progress, capped below 1.0 until actually ready.
            let fraction = started.elapsed().as_secs_f64() / ceiling.as_secs_f64();
            let progress = (0.1 + 0.89 * fraction).min(0.99);
            reporter.report(LaunchPhase::WaitingForReady, progress, "waiting for backend");

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    fn log_file_path(&self, recipe_id: &str) -> PathBuf {
        self.log_dir.join(format!("{recipe_id}.log"))
    }
}

fn health_url(spec: &LaunchSpec, host: &str) -> String {
    let port = spec.effective_port();
    // Ollama has no /health; its root answers 200 once it is up.
    let path = match spec.backend {
        BackendKind::Ollama => "/",
        _ => "/health",
    };
    format!("http://{host}:{port}{path}")
}

fn spawn_env(spec: &LaunchSpec) -> Vec<(String, String)> {
    match spec.backend {
        BackendKind::Ollama => vec![(
            "OLLAMA_HOST".to_string(),
            format!("{}:{}", spec.host, spec.effective_port()),
        )],
        _ => Vec::new(),
    }
}

/// Scan complete log lines past `offset` for a fatal pattern, advancing the
/// offset. A half-written trailing line is left for the next scan so a
/// pattern split across two reads is still matched. A truncated file
/// restarts the scan from the top.
async fn scan_new_lines(log_file: &Path, offset: &mut usize) -> Option<String> {
    let bytes = tokio::fs::read(log_file).await.ok()?;
    if bytes.len() < *offset {
        *offset = 0;
    }
    let tail = &bytes[*offset..];
    let consumed = tail.iter().rposition(|&b| b == b'\n')? + 1;
    let new = String::from_utf8_lossy(&tail[..consumed]).into_owned();
    *offset += consumed;

    new.lines()
        .find(|line| FATAL_LOG_PATTERNS.iter().any(|p| line.contains(p)))
        .map(|line| line.trim().to_string())
}

/// Last few log lines, for failure messages.
async fn log_tail(log_file: &Path) -> String {
    match tokio::fs::read(log_file).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().rev().take(5).collect();
            lines.into_iter().rev().collect::<Vec<_>>().join("\n")
        }
        Err(_) => "(no log captured)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeLister, FakeSpawner, MockHttpClient, test_config};
    use axum::http::StatusCode;

    fn orchestrator(
        lister: FakeLister,
        client: MockHttpClient,
    ) -> Orchestrator<MockHttpClient> {
        let mut config = test_config();
        config.log_dir = tempfile::tempdir().unwrap().keep();
        let spawner = FakeSpawner::new(lister.clone());
        Orchestrator::new(
            &config,
            client,
            Box::new(lister),
            Box::new(spawner),
            Arc::new(EventBus::new()),
        )
        .with_evict_timing(Duration::from_millis(20), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_switch_to_unknown_recipe_fails() {
        let result = orchestrator(
            FakeLister::default(),
            MockHttpClient::new(StatusCode::OK, "{}"),
        )
        .switch_to("nope")
        .await;

        assert!(!result.success);
        assert!(result.message.contains("recipe not found"));
    }

    #[tokio::test]
    async fn test_switch_to_reaches_ready() {
        let lister = FakeLister::default();
        let orch = orchestrator(lister, MockHttpClient::new(StatusCode::OK, "{}"));

        let events = Arc::clone(orch.events());
        let sub = events.subscribe(DEFAULT_CHANNEL);

        let result = orch.switch_to("qwen").await;
        assert!(result.success, "launch failed: {}", result.message);
        assert!(result.pid.is_some());

        // The stream of progress events ends in the ready state and never
        // moves backwards.
        let mut last = -1.0f64;
        let mut final_state = String::new();
        while let Some(event) = tokio::time::timeout(Duration::from_millis(50), sub.next())
            .await
            .ok()
            .flatten()
        {
            let progress = event.data["progress"].as_f64().unwrap();
            assert!(progress >= last, "progress went backwards");
            last = progress;
            final_state = event.data["state"].as_str().unwrap_or_default().to_string();
        }
        assert_eq!(final_state, "ready");
    }

    #[tokio::test]
    async fn test_switch_evicts_previous_backend() {
        let lister = FakeLister::default();
        lister.add(
            42,
            None,
            vec![
                "vllm".to_string(),
                "serve".to_string(),
                "old-model".to_string(),
                "--port".to_string(),
                "8000".to_string(),
            ],
        );
        let signals = lister.signals();
        lister.die_on_terminate(42);

        let orch = orchestrator(lister, MockHttpClient::new(StatusCode::OK, "{}"));
        let result = orch.switch_to("qwen").await;

        assert!(result.success, "launch failed: {}", result.message);
        let sent = signals.lock().unwrap().clone();
        assert!(sent.contains(&(42, "TERM")));
    }

    #[tokio::test]
    async fn test_readiness_timeout_kills_backend() {
        let lister = FakeLister::default();
        let signals = lister.signals();
        let orch = orchestrator(
            lister,
            MockHttpClient::new(StatusCode::SERVICE_UNAVAILABLE, "starting"),
        );

        let started = tokio::time::Instant::now();
        let result = orch.switch_to("qwen").await;
        let elapsed = started.elapsed();

        assert!(!result.success);
        assert!(result.message.contains("did not become ready"));
        assert!(result.log_file.is_some());
        // The timeout fires within [ceiling, ceiling + poll interval], plus
        // slack for eviction timing and scheduling.
        let ceiling = Duration::from_secs(1);
        let poll = Duration::from_secs(1);
        assert!(elapsed >= ceiling, "timed out early: {elapsed:?}");
        assert!(
            elapsed <= ceiling + poll + Duration::from_millis(500),
            "timed out late: {elapsed:?}"
        );
        // The stuck backend was hard-killed.
        let killed = signals
            .lock()
            .unwrap()
            .iter()
            .any(|(_, sig)| *sig == "KILL");
        assert!(killed);
    }

    #[tokio::test]
    async fn test_explicit_switch_preempts_in_flight_attempt() {
        let lister = FakeLister::default();
        let orch = Arc::new(orchestrator(
            lister,
            MockHttpClient::new(StatusCode::SERVICE_UNAVAILABLE, "starting"),
        ));

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.switch_to("qwen").await })
        };
        // Let the first attempt take the lock and enter polling.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.switch_to("gguf").await })
        };

        let first_result = first.await.unwrap();
        assert!(!first_result.success);
        assert!(first_result.message.contains("cancelled"));

        // The second attempt runs to its own (failing) conclusion; the
        // point is it was never blocked behind the first.
        let second_result = second.await.unwrap();
        assert_eq!(second_result.recipe, "gguf");
    }

    #[tokio::test]
    async fn test_cancel_launch_by_recipe() {
        let lister = FakeLister::default();
        let orch = Arc::new(orchestrator(
            lister,
            MockHttpClient::new(StatusCode::SERVICE_UNAVAILABLE, "starting"),
        ));

        let attempt = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.switch_to("qwen").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(orch.cancel_launch(Some("qwen")).await, 1);
        let result = attempt.await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("cancelled"));

        // Nothing left to cancel.
        assert_eq!(orch.cancel_launch(None).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_with_no_attempt_evicts_running_backend() {
        let lister = FakeLister::default();
        lister.add(
            11,
            None,
            vec![
                "vllm".to_string(),
                "serve".to_string(),
                "Qwen/Qwen2.5-7B-Instruct".to_string(),
                "--port".to_string(),
                "8000".to_string(),
            ],
        );
        let signals = lister.signals();
        lister.die_on_terminate(11);

        let orch = orchestrator(lister, MockHttpClient::new(StatusCode::OK, "{}"));

        // No attempt is tracked, but "qwen" is the backend on the GPU:
        // cancelling it falls back to eviction.
        assert_eq!(orch.cancel_launch(Some("qwen")).await, 1);
        assert!(signals.lock().unwrap().contains(&(11, "TERM")));

        // Nothing running or in flight now.
        assert_eq!(orch.cancel_launch(Some("qwen")).await, 0);
    }

    #[tokio::test]
    async fn test_dropped_attempt_leaves_no_registry_entry() {
        let orch = Arc::new(orchestrator(
            FakeLister::default(),
            MockHttpClient::new(StatusCode::SERVICE_UNAVAILABLE, "starting"),
        ));

        let attempt = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.switch_to("qwen").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Abort the task driving the attempt, as a disconnecting HTTP
        // caller would.
        attempt.abort();
        let _ = attempt.await;

        assert_eq!(orch.cancel_launch(None).await, 0);
    }

    #[tokio::test]
    async fn test_evict_without_replacement() {
        let lister = FakeLister::default();
        lister.add(
            7,
            None,
            vec![
                "llama-server".to_string(),
                "--model".to_string(),
                "/m.gguf".to_string(),
                "--port".to_string(),
                "8000".to_string(),
            ],
        );
        let signals = lister.signals();

        let orch = orchestrator(lister, MockHttpClient::new(StatusCode::OK, "{}"));
        assert_eq!(orch.evict(true).await, Some(7));
        assert_eq!(signals.lock().unwrap().clone(), vec![(7, "KILL")]);

        // Idempotent: nothing running now.
        assert_eq!(orch.evict(true).await, None);
    }

    #[tokio::test]
    async fn test_fatal_pattern_split_across_writes_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("backend.log");

        // The fatal line is only half-written on the first scan.
        tokio::fs::write(&log, "loading weights\nCUDA out of")
            .await
            .unwrap();
        let mut offset = 0;
        assert_eq!(scan_new_lines(&log, &mut offset).await, None);

        // The rest of the line arrives; the pattern must still match.
        tokio::fs::write(&log, "loading weights\nCUDA out of memory\n")
            .await
            .unwrap();
        assert_eq!(
            scan_new_lines(&log, &mut offset).await.as_deref(),
            Some("CUDA out of memory")
        );
    }

    #[tokio::test]
    async fn test_ensure_model_matches_running_backend() {
        let lister = FakeLister::default();
        lister.add(
            11,
            None,
            vec![
                "vllm".to_string(),
                "serve".to_string(),
                "Qwen/Qwen2.5-7B-Instruct".to_string(),
                "--port".to_string(),
                "8000".to_string(),
            ],
        );
        let orch = orchestrator(lister, MockHttpClient::new(StatusCode::OK, "{}"));

        // Already serving the requested model: no switch.
        orch.ensure_model("Qwen/Qwen2.5-7B-Instruct").await.unwrap();

        // Unknown model with no matching recipe.
        let err = orch.ensure_model("missing/model").await.unwrap_err();
        assert!(matches!(err, SwitchError::RecipeNotFound(_)));
    }
}

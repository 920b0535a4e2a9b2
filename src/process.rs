//! Process discovery and control
//!
//! The OS process table is the single source of truth for "what is
//! currently running": handles are recomputed by inspection on demand and
//! never cached. Enumeration and signalling sit behind the [`ProcessLister`]
//! capability so orchestration logic can be exercised against a fabricated
//! table.

use crate::client::{HttpClient, get_with_timeout};
use crate::config::BackendKind;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{Signal, System};
use tracing::{debug, info, warn};

/// Bounded wait for a gracefully-terminated root to disappear before
/// escalating to a hard kill.
pub const EVICT_GRACE_WAIT: Duration = Duration::from_secs(10);

/// Device memory release lags process death; eviction is not declared
/// complete until this delay has passed.
pub const GPU_SETTLE_DELAY: Duration = Duration::from_secs(2);

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MODEL_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// One row of the process table.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent: Option<u32>,
    pub argv: Vec<String>,
}

/// Capability over the OS process table: enumeration plus signal delivery.
///
/// Signalling an already-dead pid is success (eviction is idempotent), so
/// implementations return nothing for the kill operations.
pub trait ProcessLister: Send + Sync {
    fn processes(&self) -> Vec<ProcessRecord>;
    fn is_alive(&self, pid: u32) -> bool;
    /// Graceful terminate (SIGTERM)
    fn terminate(&self, pid: u32);
    /// Hard kill (SIGKILL)
    fn kill(&self, pid: u32);
}

/// Production lister backed by `sysinfo`, refreshing on every call.
#[derive(Debug, Default)]
pub struct SysinfoLister;

impl ProcessLister for SysinfoLister {
    fn processes(&self) -> Vec<ProcessRecord> {
        let sys = System::new_all();
        sys.processes()
            .iter()
            .map(|(pid, process)| ProcessRecord {
                pid: pid.as_u32(),
                parent: process.parent().map(|p| p.as_u32()),
                argv: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        let sys = System::new_all();
        sys.process(sysinfo::Pid::from_u32(pid)).is_some()
    }

    fn terminate(&self, pid: u32) {
        let sys = System::new_all();
        if let Some(process) = sys.process(sysinfo::Pid::from_u32(pid)) {
            process.kill_with(Signal::Term);
        }
    }

    fn kill(&self, pid: u32) {
        let sys = System::new_all();
        if let Some(process) = sys.process(sysinfo::Pid::from_u32(pid)) {
            process.kill();
        }
    }
}

/// A running backend, derived by inspection. At most one handle exists per
/// managed port at any time.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub backend: BackendKind,
    pub model_path: String,
    pub port: u16,
    pub served_model_name: Option<String>,
}

/// Discovery plus two-phase tree eviction over a [`ProcessLister`].
pub struct ProcessManager<C> {
    lister: Box<dyn ProcessLister>,
    client: C,
    grace_wait: Duration,
    settle_delay: Duration,
    poll_interval: Duration,
    /// Trusted state file naming the model Ollama currently serves
    ollama_state_file: Option<PathBuf>,
}

impl<C: HttpClient> ProcessManager<C> {
    pub fn new(lister: Box<dyn ProcessLister>, client: C) -> Self {
        Self {
            lister,
            client,
            grace_wait: EVICT_GRACE_WAIT,
            settle_delay: GPU_SETTLE_DELAY,
            poll_interval: LIVENESS_POLL_INTERVAL,
            ollama_state_file: std::env::var_os("OLLAMA_ACTIVE_FILE").map(PathBuf::from),
        }
    }

    /// Override eviction timing (tests shrink these to milliseconds).
    pub fn with_timing(mut self, grace_wait: Duration, settle_delay: Duration) -> Self {
        self.grace_wait = grace_wait;
        self.settle_delay = settle_delay;
        self.poll_interval = self.poll_interval.min(grace_wait / 4).max(Duration::from_millis(1));
        self
    }

    /// Whether `pid` is still present in the process table.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.lister.is_alive(pid)
    }

    /// Find the backend process serving `port`, if any.
    ///
    /// Ollama always binds its well-known port, so an Ollama process matches
    /// whatever port was asked for.
    pub async fn find_inference_process(&self, port: u16) -> Option<ProcessHandle> {
        for record in self.lister.processes() {
            let Some(candidate) = classify(&record) else {
                continue;
            };

            let matches = match candidate.backend {
                BackendKind::Ollama => true,
                _ => candidate.port == Some(port),
            };
            if !matches {
                continue;
            }

            let handle = self.resolve(record.pid, candidate).await;
            debug!(pid = handle.pid, backend = %handle.backend, model = %handle.model_path,
                "found inference process");
            return Some(handle);
        }
        None
    }

    /// Fill in whatever the command line did not make explicit.
    async fn resolve(&self, pid: u32, candidate: Candidate) -> ProcessHandle {
        let port = candidate
            .backend
            .well_known_port()
            .or(candidate.port)
            .unwrap_or_default();

        let mut model_path = candidate.model_path.unwrap_or_default();
        let mut served_model_name = candidate.served_model_name;

        if model_path.is_empty() {
            if let Some(model) = self.read_trusted_state_file() {
                model_path = model;
            } else if let Some(model) = self.lookup_served_model(port).await {
                model_path = model;
            }
        }
        if served_model_name.is_none() && !model_path.is_empty() {
            served_model_name = Some(model_path.clone());
        }

        ProcessHandle {
            pid,
            backend: candidate.backend,
            model_path,
            port,
            served_model_name,
        }
    }

    fn read_trusted_state_file(&self) -> Option<String> {
        let path = self.ollama_state_file.as_ref()?;
        let contents = std::fs::read_to_string(path).ok()?;
        let state: serde_json::Value = serde_json::from_str(&contents).ok()?;
        state["model"].as_str().map(str::to_string)
    }

    /// Last resort: ask the backend's own model-listing endpoint.
    async fn lookup_served_model(&self, port: u16) -> Option<String> {
        let url = format!("http://127.0.0.1:{port}/v1/models");
        let (status, body) = get_with_timeout(&self.client, &url, MODEL_LOOKUP_TIMEOUT)
            .await
            .ok()?;
        if status != 200 {
            return None;
        }
        let listing: serde_json::Value = serde_json::from_slice(&body).ok()?;
        listing["data"][0]["id"].as_str().map(str::to_string)
    }

    /// Kill `pid` and all of its transitive descendants.
    ///
    /// Graceful path: terminate everything, wait up to the grace window for
    /// the root to disappear, then escalate to a hard kill. Forced path:
    /// hard-kill immediately. Either way the settle delay runs before
    /// completion is declared.
    pub async fn kill_process_tree(&self, pid: u32, force: bool) {
        let targets = self.collect_tree(pid);
        info!(pid, force, count = targets.len(), "killing process tree");

        if force {
            for target in &targets {
                self.lister.kill(*target);
            }
        } else {
            for target in &targets {
                self.lister.terminate(*target);
            }

            let deadline = tokio::time::Instant::now() + self.grace_wait;
            while tokio::time::Instant::now() < deadline {
                if !self.lister.is_alive(pid) {
                    break;
                }
                tokio::time::sleep(self.poll_interval).await;
            }

            if self.lister.is_alive(pid) {
                warn!(pid, "still alive after graceful wait; escalating to SIGKILL");
                for target in &targets {
                    self.lister.kill(*target);
                }
            }
        }

        tokio::time::sleep(self.settle_delay).await;
    }

    /// The target pid plus all transitive descendants.
    fn collect_tree(&self, pid: u32) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for record in self.lister.processes() {
            if let Some(parent) = record.parent {
                children.entry(parent).or_default().push(record.pid);
            }
        }

        let mut targets = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            targets.push(current);
            if let Some(kids) = children.get(&current) {
                queue.extend(kids.iter().copied());
            }
        }
        targets
    }
}

struct Candidate {
    backend: BackendKind,
    model_path: Option<String>,
    served_model_name: Option<String>,
    port: Option<u16>,
}

/// Classify a process against the known backend invocation signatures.
fn classify(record: &ProcessRecord) -> Option<Candidate> {
    let argv = &record.argv;
    let program = argv.first()?;

    // `vllm serve <model> ...` or `python -m vllm.entrypoints.openai.api_server`
    let module_entry = argv
        .iter()
        .any(|a| a.contains("vllm.entrypoints.openai.api_server"));
    if module_entry || program.ends_with("vllm") {
        let model_path = if module_entry {
            flag_value(argv, "--model")
        } else {
            positional_after(argv, "serve").or_else(|| flag_value(argv, "--model"))
        };
        return Some(Candidate {
            backend: BackendKind::Vllm,
            model_path,
            served_model_name: flag_value(argv, "--served-model-name"),
            port: flag_value(argv, "--port").and_then(|p| p.parse().ok()),
        });
    }

    if program.contains("llama-server") {
        return Some(Candidate {
            backend: BackendKind::LlamaCpp,
            model_path: flag_value(argv, "--model").or_else(|| flag_value(argv, "-m")),
            served_model_name: flag_value(argv, "--alias"),
            port: flag_value(argv, "--port").and_then(|p| p.parse().ok()),
        });
    }

    // Ollama exposes neither model nor port on its command line.
    if program.contains("ollama") && argv.get(1).is_some_and(|a| a == "serve") {
        return Some(Candidate {
            backend: BackendKind::Ollama,
            model_path: None,
            served_model_name: None,
            port: BackendKind::Ollama.well_known_port(),
        });
    }

    None
}

/// Value for `--flag value` or `--flag=value`.
fn flag_value(argv: &[String], flag: &str) -> Option<String> {
    for (i, arg) in argv.iter().enumerate() {
        if arg == flag {
            return argv.get(i + 1).cloned();
        }
        if let Some(value) = arg.strip_prefix(&format!("{flag}=")) {
            return Some(value.to_string());
        }
    }
    None
}

/// First non-flag argument after `marker` (the `serve`-style positional).
fn positional_after(argv: &[String], marker: &str) -> Option<String> {
    let at = argv.iter().position(|a| a == marker)?;
    argv[at + 1..]
        .iter()
        .find(|a| !a.starts_with('-'))
        .cloned()
}

//! Test doubles: a scriptable process table, spawner, and HTTP client.
//!
//! These live in the library (not behind `cfg(test)`) so the integration
//! tests can drive the full router without real processes or sockets.

use crate::config::{BackendKind, Config, RecipeConfig, TimeoutConfig};
use crate::orchestrator::BackendSpawner;
use crate::process::{ProcessLister, ProcessRecord};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Per-process log directory so concurrent test runs never collide.
fn test_log_dir() -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "switchboard-test-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Minimal two-recipe config with timeouts shrunk for test speed.
pub fn test_config() -> Config {
    let mut recipes = HashMap::new();
    recipes.insert(
        "qwen".to_string(),
        RecipeConfig {
            backend: BackendKind::Vllm,
            model_path: "Qwen/Qwen2.5-7B-Instruct".to_string(),
            served_model_name: Some("qwen".to_string()),
            tensor_parallel_size: 1,
            max_model_len: None,
            gpu_memory_utilization: 0.9,
            tool_call_parser: None,
            reasoning_parser: None,
            extra_flags: serde_json::Map::new(),
        },
    );
    recipes.insert(
        "gguf".to_string(),
        RecipeConfig {
            backend: BackendKind::LlamaCpp,
            model_path: "/models/test.gguf".to_string(),
            served_model_name: None,
            tensor_parallel_size: 1,
            max_model_len: Some(4096),
            gpu_memory_utilization: 0.9,
            tool_call_parser: None,
            reasoning_parser: None,
            extra_flags: serde_json::Map::new(),
        },
    );

    Config {
        recipes,
        port: 0,
        managed_port: 8000,
        host: "127.0.0.1".to_string(),
        log_dir: test_log_dir(),
        timeouts: TimeoutConfig {
            lock_timeout_secs: 1,
            poll_interval_secs: 1,
            ready_ceiling_secs: 1,
            spawn_grace_ms: 5,
        },
    }
}

#[derive(Debug, Default)]
struct FakeTable {
    records: Vec<ProcessRecord>,
    dies_on_terminate: HashSet<u32>,
}

/// In-memory process table. Clones share state, so a spawner and a manager
/// built from the same lister observe the same processes.
#[derive(Debug, Clone, Default)]
pub struct FakeLister {
    table: Arc<Mutex<FakeTable>>,
    signals: Arc<Mutex<Vec<(u32, &'static str)>>>,
}

impl FakeLister {
    pub fn add(&self, pid: u32, parent: Option<u32>, argv: Vec<String>) {
        self.table
            .lock()
            .unwrap()
            .records
            .push(ProcessRecord { pid, parent, argv });
    }

    /// Shared log of every signal delivered, in order.
    pub fn signals(&self) -> Arc<Mutex<Vec<(u32, &'static str)>>> {
        Arc::clone(&self.signals)
    }

    /// Make `pid` exit as soon as it receives SIGTERM.
    pub fn die_on_terminate(&self, pid: u32) {
        self.table.lock().unwrap().dies_on_terminate.insert(pid);
    }

    fn remove(table: &mut FakeTable, pid: u32) {
        table.records.retain(|r| r.pid != pid);
    }
}

impl ProcessLister for FakeLister {
    fn processes(&self) -> Vec<ProcessRecord> {
        self.table.lock().unwrap().records.clone()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.table
            .lock()
            .unwrap()
            .records
            .iter()
            .any(|r| r.pid == pid)
    }

    fn terminate(&self, pid: u32) {
        self.signals.lock().unwrap().push((pid, "TERM"));
        let mut table = self.table.lock().unwrap();
        if table.dies_on_terminate.contains(&pid) {
            Self::remove(&mut table, pid);
        }
    }

    fn kill(&self, pid: u32) {
        self.signals.lock().unwrap().push((pid, "KILL"));
        let mut table = self.table.lock().unwrap();
        Self::remove(&mut table, pid);
    }
}

/// Spawner that registers a fake process in the shared table instead of
/// forking. The log file is created empty so log scanning has something to
/// read.
#[derive(Debug)]
pub struct FakeSpawner {
    lister: FakeLister,
    next_pid: AtomicU32,
    spawned: Arc<Mutex<Vec<(String, Vec<String>, PathBuf)>>>,
}

impl FakeSpawner {
    pub fn new(lister: FakeLister) -> Self {
        Self {
            lister,
            next_pid: AtomicU32::new(5000),
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every spawn call: program, args, log path.
    pub fn spawned(&self) -> Arc<Mutex<Vec<(String, Vec<String>, PathBuf)>>> {
        Arc::clone(&self.spawned)
    }
}

impl BackendSpawner for FakeSpawner {
    fn spawn(
        &self,
        program: &str,
        args: &[String],
        _envs: &[(String, String)],
        log_file: &Path,
    ) -> Result<u32, String> {
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(log_file, b"").map_err(|e| e.to_string())?;

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().cloned());
        self.lister.add(pid, None, argv);
        self.spawned
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec(), log_file.to_path_buf()));
        Ok(pid)
    }
}

enum MockBody {
    Fixed(String),
    /// Chunks delivered as a byte stream, one poll apart
    Streaming(Vec<String>),
}

/// HTTP client double returning a canned response to every request.
pub struct MockHttpClient {
    status: StatusCode,
    body: Arc<MockBody>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Clone for MockHttpClient {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            body: Arc::clone(&self.body),
            requests: Arc::clone(&self.requests),
        }
    }
}

impl std::fmt::Debug for MockHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHttpClient")
            .field("status", &self.status)
            .finish()
    }
}

impl MockHttpClient {
    pub fn new(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: Arc::new(MockBody::Fixed(body.to_string())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Respond with an SSE-style chunked body.
    pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
        Self {
            status,
            body: Arc::new(MockBody::Streaming(chunks)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// URIs of every request made through this client, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::client::HttpClient for MockHttpClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.requests.lock().unwrap().push(req.uri().to_string());

        let response = match &*self.body {
            MockBody::Fixed(body) => (self.status, body.clone()).into_response(),
            MockBody::Streaming(chunks) => {
                let stream = futures_util::stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|c| Ok::<_, std::convert::Infallible>(Bytes::from(c))),
                );
                let mut response = axum::response::Response::new(
                    axum::body::Body::from_stream(stream),
                );
                *response.status_mut() = self.status;
                response.headers_mut().insert(
                    axum::http::header::CONTENT_TYPE,
                    axum::http::HeaderValue::from_static("text/event-stream"),
                );
                response
            }
        };
        Ok(response)
    }
}

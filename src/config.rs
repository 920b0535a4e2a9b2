//! Configuration: stored recipes and per-attempt launch specs
//!
//! A recipe is the stored description of one model-serving setup. A
//! [`LaunchSpec`] is built fresh from a recipe for every launch attempt and
//! never mutated in place; the orchestrator treats it as immutable for the
//! lifetime of that attempt.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Supported inference engines. Closed set: process classification and
/// command-line construction are both keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vllm,
    LlamaCpp,
    Ollama,
}

impl BackendKind {
    /// The executable used to launch this backend.
    pub fn program(&self) -> &'static str {
        match self {
            BackendKind::Vllm => "vllm",
            BackendKind::LlamaCpp => "llama-server",
            BackendKind::Ollama => "ollama",
        }
    }

    /// Ollama always binds its well-known port regardless of what the spec
    /// asks for.
    pub fn well_known_port(&self) -> Option<u16> {
        match self {
            BackendKind::Ollama => Some(11434),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Vllm => write!(f, "vllm"),
            BackendKind::LlamaCpp => write!(f, "llama_cpp"),
            BackendKind::Ollama => write!(f, "ollama"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stored launch configurations keyed by recipe id
    pub recipes: HashMap<String, RecipeConfig>,

    /// Control plane listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port managed backends are told to bind
    #[serde(default = "default_managed_port")]
    pub managed_port: u16,

    /// Host managed backends bind and are probed on
    #[serde(default = "default_host")]
    pub host: String,

    /// Directory for captured launch logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_port() -> u16 {
    3000
}

fn default_managed_port() -> u16 {
    8000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/switchboard/logs")
}

/// Tunable timing knobs, all with the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Switch-lock acquisition timeout before force-evicting
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Interval between readiness probes
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Overall readiness ceiling
    #[serde(default = "default_ready_ceiling_secs")]
    pub ready_ceiling_secs: u64,
    /// Grace delay after spawn before the immediate-exit check
    #[serde(default = "default_spawn_grace_ms")]
    pub spawn_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            ready_ceiling_secs: default_ready_ceiling_secs(),
            spawn_grace_ms: default_spawn_grace_ms(),
        }
    }
}

fn default_lock_timeout_secs() -> u64 {
    2
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_ready_ceiling_secs() -> u64 {
    300
}

fn default_spawn_grace_ms() -> u64 {
    1500
}

impl Config {
    /// Load configuration from a JSON file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Stored configuration for one model-serving setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeConfig {
    pub backend: BackendKind,

    /// HuggingFace model id or local path (GGUF path for llama.cpp, model
    /// tag for ollama)
    pub model_path: String,

    /// Name the model is served under, when it differs from the path
    #[serde(default)]
    pub served_model_name: Option<String>,

    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: usize,

    /// Context length (`--max-model-len` / `--ctx-size`)
    #[serde(default)]
    pub max_model_len: Option<u32>,

    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f32,

    /// vLLM tool-call parser hint; implies --enable-auto-tool-choice
    #[serde(default)]
    pub tool_call_parser: Option<String>,

    /// vLLM reasoning parser hint
    #[serde(default)]
    pub reasoning_parser: Option<String>,

    /// Engine-specific extra flags, appended verbatim as `--kebab-case`
    #[serde(default)]
    pub extra_flags: serde_json::Map<String, serde_json::Value>,
}

fn default_tensor_parallel_size() -> usize {
    1
}

fn default_gpu_memory_utilization() -> f32 {
    0.9
}

/// Immutable description of one launch attempt.
///
/// Always constructed fresh via [`LaunchSpec::from_recipe`], even when the
/// same recipe id is switched to twice in a row.
#[derive(Debug, Clone, bon::Builder)]
pub struct LaunchSpec {
    pub recipe_id: String,
    pub backend: BackendKind,
    pub model_path: String,
    pub host: String,
    pub port: u16,
    #[builder(default = 1)]
    pub tensor_parallel_size: usize,
    pub max_model_len: Option<u32>,
    #[builder(default = 0.9)]
    pub gpu_memory_utilization: f32,
    pub served_model_name: Option<String>,
    pub tool_call_parser: Option<String>,
    pub reasoning_parser: Option<String>,
    #[builder(default)]
    pub extra_flags: serde_json::Map<String, serde_json::Value>,
}

/// Boolean flags that must be explicitly negated when false instead of being
/// omitted (vLLM changes their defaults between releases).
const EXPLICIT_NEGATION_FLAGS: &[&str] = &["enable-prefix-caching", "enable-chunked-prefill"];

impl LaunchSpec {
    pub fn from_recipe(recipe_id: &str, recipe: &RecipeConfig, host: &str, port: u16) -> Self {
        LaunchSpec::builder()
            .recipe_id(recipe_id.to_string())
            .backend(recipe.backend)
            .model_path(recipe.model_path.clone())
            .host(host.to_string())
            .port(port)
            .tensor_parallel_size(recipe.tensor_parallel_size)
            .maybe_max_model_len(recipe.max_model_len)
            .gpu_memory_utilization(recipe.gpu_memory_utilization)
            .maybe_served_model_name(recipe.served_model_name.clone())
            .maybe_tool_call_parser(recipe.tool_call_parser.clone())
            .maybe_reasoning_parser(recipe.reasoning_parser.clone())
            .extra_flags(recipe.extra_flags.clone())
            .build()
    }

    /// Port the backend will actually bind.
    pub fn effective_port(&self) -> u16 {
        self.backend.well_known_port().unwrap_or(self.port)
    }

    pub fn program(&self) -> &'static str {
        self.backend.program()
    }

    /// Build the backend command line.
    ///
    /// Required positionals (model, host, port) come before optional flags;
    /// extra flags are appended last.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = match self.backend {
            BackendKind::Vllm => {
                let mut args = vec![
                    "serve".to_string(),
                    self.model_path.clone(),
                    "--host".to_string(),
                    self.host.clone(),
                    "--port".to_string(),
                    self.port.to_string(),
                    "--tensor-parallel-size".to_string(),
                    self.tensor_parallel_size.to_string(),
                    "--gpu-memory-utilization".to_string(),
                    self.gpu_memory_utilization.to_string(),
                ];
                if let Some(len) = self.max_model_len {
                    args.push("--max-model-len".to_string());
                    args.push(len.to_string());
                }
                if let Some(ref name) = self.served_model_name {
                    args.push("--served-model-name".to_string());
                    args.push(name.clone());
                }
                if let Some(ref parser) = self.tool_call_parser {
                    args.push("--tool-call-parser".to_string());
                    args.push(parser.clone());
                    args.push("--enable-auto-tool-choice".to_string());
                }
                if let Some(ref parser) = self.reasoning_parser {
                    args.push("--reasoning-parser".to_string());
                    args.push(parser.clone());
                }
                args
            }
            BackendKind::LlamaCpp => {
                let mut args = vec![
                    "--model".to_string(),
                    self.model_path.clone(),
                    "--host".to_string(),
                    self.host.clone(),
                    "--port".to_string(),
                    self.port.to_string(),
                ];
                if let Some(len) = self.max_model_len {
                    args.push("--ctx-size".to_string());
                    args.push(len.to_string());
                }
                if let Some(ref name) = self.served_model_name {
                    args.push("--alias".to_string());
                    args.push(name.clone());
                }
                args
            }
            // Ollama takes no model arguments; the model is resolved per
            // request and the bind address comes from OLLAMA_HOST.
            BackendKind::Ollama => vec!["serve".to_string()],
        };

        append_extra_flags(&mut args, &self.extra_flags);
        args
    }
}

/// Render the open-ended extra-flag map.
///
/// Keys become `--kebab-case`; `true` is a bare flag, `false` is omitted
/// unless the flag is on the explicit-negation denylist.
fn append_extra_flags(args: &mut Vec<String>, flags: &serde_json::Map<String, serde_json::Value>) {
    for (key, value) in flags {
        let flag = key.replace('_', "-");
        match value {
            serde_json::Value::Bool(true) => args.push(format!("--{flag}")),
            serde_json::Value::Bool(false) => {
                if EXPLICIT_NEGATION_FLAGS.contains(&flag.as_str()) {
                    args.push(format!("--no-{flag}"));
                }
            }
            serde_json::Value::String(s) => {
                args.push(format!("--{flag}"));
                args.push(s.clone());
            }
            serde_json::Value::Null => {}
            other => {
                args.push(format!("--{flag}"));
                args.push(other.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(BackendKind::Vllm, "vllm", None)]
    #[case(BackendKind::LlamaCpp, "llama-server", None)]
    #[case(BackendKind::Ollama, "ollama", Some(11434))]
    fn test_backend_identity(
        #[case] kind: BackendKind,
        #[case] program: &str,
        #[case] well_known: Option<u16>,
    ) {
        assert_eq!(kind.program(), program);
        assert_eq!(kind.well_known_port(), well_known);
    }

    fn vllm_spec() -> LaunchSpec {
        LaunchSpec::builder()
            .recipe_id("qwen".to_string())
            .backend(BackendKind::Vllm)
            .model_path("Qwen/Qwen2.5-7B-Instruct".to_string())
            .host("127.0.0.1".to_string())
            .port(8000)
            .tensor_parallel_size(2)
            .max_model_len(8192)
            .tool_call_parser("hermes".to_string())
            .build()
    }

    #[test]
    fn test_parse_config_with_defaults() {
        let json = r#"{
            "recipes": {
                "qwen": {
                    "backend": "vllm",
                    "model_path": "Qwen/Qwen2.5-7B-Instruct"
                },
                "local-gguf": {
                    "backend": "llama_cpp",
                    "model_path": "/models/qwen.gguf",
                    "max_model_len": 4096
                }
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.recipes.len(), 2);
        assert_eq!(config.port, 3000);
        assert_eq!(config.managed_port, 8000);
        assert_eq!(config.timeouts.ready_ceiling_secs, 300);
        assert_eq!(config.recipes["qwen"].tensor_parallel_size, 1);
        assert_eq!(config.recipes["local-gguf"].max_model_len, Some(4096));
    }

    #[test]
    fn test_vllm_positionals_precede_flags() {
        let args = vllm_spec().command_args();
        assert_eq!(args[0], "serve");
        assert_eq!(args[1], "Qwen/Qwen2.5-7B-Instruct");
        let port_at = args.iter().position(|a| a == "--port").unwrap();
        let parser_at = args.iter().position(|a| a == "--tool-call-parser").unwrap();
        assert!(port_at < parser_at);
        assert!(args.contains(&"--enable-auto-tool-choice".to_string()));
    }

    #[test]
    fn test_extra_flag_rendering() {
        let mut spec = vllm_spec();
        spec.extra_flags = json!({
            "enforce_eager": true,
            "enable_prefix_caching": false,
            "swap_space": 4,
            "quantization": "awq",
            "trust_remote_code": false
        })
        .as_object()
        .unwrap()
        .clone();

        let args = spec.command_args();
        assert!(args.contains(&"--enforce-eager".to_string()));
        // On the denylist: must be explicitly negated.
        assert!(args.contains(&"--no-enable-prefix-caching".to_string()));
        // Not on the denylist: false means omitted entirely.
        assert!(!args.iter().any(|a| a.contains("trust-remote-code")));
        let swap_at = args.iter().position(|a| a == "--swap-space").unwrap();
        assert_eq!(args[swap_at + 1], "4");
        let quant_at = args.iter().position(|a| a == "--quantization").unwrap();
        assert_eq!(args[quant_at + 1], "awq");
    }

    #[test]
    fn test_llama_cpp_args() {
        let spec = LaunchSpec::builder()
            .recipe_id("gguf".to_string())
            .backend(BackendKind::LlamaCpp)
            .model_path("/models/qwen.gguf".to_string())
            .host("127.0.0.1".to_string())
            .port(8080)
            .max_model_len(4096)
            .served_model_name("qwen-local".to_string())
            .build();

        let args = spec.command_args();
        assert_eq!(args[..2], ["--model".to_string(), "/models/qwen.gguf".to_string()]);
        assert!(args.contains(&"--ctx-size".to_string()));
        assert!(args.contains(&"--alias".to_string()));
        assert_eq!(spec.effective_port(), 8080);
    }

    #[test]
    fn test_ollama_fixed_port() {
        let spec = LaunchSpec::builder()
            .recipe_id("llama3".to_string())
            .backend(BackendKind::Ollama)
            .model_path("llama3:8b".to_string())
            .host("127.0.0.1".to_string())
            .port(9999)
            .build();

        assert_eq!(spec.command_args(), vec!["serve".to_string()]);
        assert_eq!(spec.effective_port(), 11434);
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use runloop_providers::{ProviderConfig, ProvidersConfig};
use runloop_types::ToolCategory;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generated per process when unset.
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub claim_poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: 4,
            claim_poll_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub renew_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            renew_interval_ms: 10_000,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub model_turn_timeout_ms: u64,
    pub persistence_timeout_ms: u64,
    pub system_prompt: Option<String>,
    pub completion_tool: String,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            model_turn_timeout_ms: 180_000,
            persistence_timeout_ms: 5_000,
            system_prompt: None,
            completion_tool: "complete".to_string(),
            provider_id: None,
            model_id: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn model_turn_timeout(&self) -> Duration {
        Duration::from_millis(self.model_turn_timeout_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter_factor: f64,
    pub rate_limit_delay_ms: u64,
}

impl Default for ModelRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter_factor: 0.1,
            rate_limit_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CategoryPolicy {
    pub timeout_ms: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 30_000,
        }
    }
}

impl CategoryPolicy {
    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Fallback for categories without their own entry.
    pub default: CategoryPolicy,
    pub categories: BTreeMap<String, CategoryPolicy>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(
            ToolCategory::NETWORK_LOOKUP.to_string(),
            CategoryPolicy::with_timeout_ms(30_000),
        );
        categories.insert(
            ToolCategory::SANDBOXED_EXECUTION.to_string(),
            CategoryPolicy::with_timeout_ms(120_000),
        );
        categories.insert(
            ToolCategory::FILE_IO.to_string(),
            CategoryPolicy::with_timeout_ms(15_000),
        );
        Self {
            default: CategoryPolicy::default(),
            categories,
        }
    }
}

impl GatewayConfig {
    pub fn policy_for(&self, category: &ToolCategory) -> &CategoryPolicy {
        self.categories
            .get(category.as_str())
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub max_len: usize,
    pub ttl_ms: u64,
    pub terminal_grace_ms: u64,
    pub tail_poll_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_len: 10_000,
            ttl_ms: 24 * 60 * 60 * 1_000,
            terminal_grace_ms: 10 * 60 * 1_000,
            tail_poll_ms: 1_000,
        }
    }
}

impl StreamConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_millis(self.terminal_grace_ms)
    }

    pub fn tail_poll(&self) -> Duration {
        Duration::from_millis(self.tail_poll_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReclaimPolicy {
    MarkFailed,
    Requeue { max_attempts: u32 },
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        ReclaimPolicy::MarkFailed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_ms: u64,
    pub stale_after_ms: u64,
    pub policy: ReclaimPolicy,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            stale_after_ms: 60_000,
            policy: ReclaimPolicy::MarkFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunloopConfig {
    pub worker: WorkerConfig,
    pub lock: LockConfig,
    pub orchestrator: OrchestratorConfig,
    pub model_retry: ModelRetryConfig,
    pub gateway: GatewayConfig,
    pub stream: StreamConfig,
    pub reaper: ReaperConfig,
    pub store_retry_attempts: u32,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

impl Default for RunloopConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            lock: LockConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            model_retry: ModelRetryConfig::default(),
            gateway: GatewayConfig::default(),
            stream: StreamConfig::default(),
            reaper: ReaperConfig::default(),
            store_retry_attempts: 3,
            providers: BTreeMap::new(),
            default_provider: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl RunloopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError(msg));
        if self.worker.concurrency == 0 {
            return fail("worker.concurrency must be at least 1".to_string());
        }
        if self.lock.ttl_ms == 0 {
            return fail("lock.ttl_ms must be positive".to_string());
        }
        if self.lock.renew_interval_ms == 0 || self.lock.renew_interval_ms * 2 >= self.lock.ttl_ms {
            return fail(format!(
                "lock.renew_interval_ms ({}) must be positive and strictly below half of lock.ttl_ms ({})",
                self.lock.renew_interval_ms, self.lock.ttl_ms
            ));
        }
        if self.orchestrator.max_iterations == 0 {
            return fail("orchestrator.max_iterations must be at least 1".to_string());
        }
        if self.orchestrator.completion_tool.trim().is_empty() {
            return fail("orchestrator.completion_tool must not be empty".to_string());
        }
        if self.model_retry.max_attempts == 0 {
            return fail("model_retry.max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.model_retry.jitter_factor) {
            return fail("model_retry.jitter_factor must be within [0, 1]".to_string());
        }
        if self.model_retry.exponential_base < 1.0 {
            return fail("model_retry.exponential_base must be at least 1".to_string());
        }
        let policies = std::iter::once(("default", &self.gateway.default)).chain(
            self.gateway
                .categories
                .iter()
                .map(|(name, policy)| (name.as_str(), policy)),
        );
        for (name, policy) in policies {
            if policy.timeout_ms == 0 || policy.failure_threshold == 0 || policy.success_threshold == 0 {
                return fail(format!(
                    "gateway policy `{name}` needs positive timeout_ms, failure_threshold and success_threshold"
                ));
            }
        }
        if self.stream.max_len == 0 {
            return fail("stream.max_len must be at least 1".to_string());
        }
        if let ReclaimPolicy::Requeue { max_attempts: 0 } = self.reaper.policy {
            return fail("reaper.policy.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self
                .providers
                .iter()
                .map(|(id, cfg)| (id.clone(), cfg.clone()))
                .collect(),
            default_provider: self.default_provider.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: built-in defaults, then the global file, the
/// project file, `RUNLOOP_*` environment variables and CLI overrides.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    global_path: Option<PathBuf>,
    project_path: Option<PathBuf>,
    cli: Value,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            global_path: resolve_global_config_path(),
            project_path: None,
            cli: empty_object(),
        }
    }

    pub fn without_global(mut self) -> Self {
        self.global_path = None;
        self
    }

    pub fn global_path(mut self, path: impl AsRef<Path>) -> Self {
        self.global_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn project_path(mut self, path: Option<impl AsRef<Path>>) -> Self {
        self.project_path = path.map(|p| p.as_ref().to_path_buf());
        self
    }

    pub fn cli_overrides(mut self, overrides: Value) -> Self {
        self.cli = overrides;
        self
    }

    pub async fn load(&self) -> anyhow::Result<RunloopConfig> {
        let layers = ConfigLayers {
            global: match &self.global_path {
                Some(path) => read_json_file(path).await?,
                None => empty_object(),
            },
            project: match &self.project_path {
                Some(path) => read_json_file(path).await?,
                None => empty_object(),
            },
            env: env_layer(|name| std::env::var(name).ok()),
            cli: self.cli.clone(),
        };
        let merged = merge_layers(&layers)?;
        let config: RunloopConfig = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_layers(layers: &ConfigLayers) -> anyhow::Result<Value> {
    let mut merged = serde_json::to_value(RunloopConfig::default())?;
    deep_merge(&mut merged, &layers.global);
    deep_merge(&mut merged, &layers.project);
    deep_merge(&mut merged, &layers.env);
    deep_merge(&mut merged, &layers.cli);
    Ok(merged)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    serde_json::from_str::<Value>(&raw)
        .map_err(|err| anyhow::anyhow!("config file {} is not valid JSON: {err}", path.display()))
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("RUNLOOP_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("runloop").join("config.json"))
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let number = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(worker_id) = var("RUNLOOP_WORKER_ID") {
        deep_merge(&mut root, &json!({ "worker": { "worker_id": worker_id } }));
    }
    if let Some(concurrency) = number("RUNLOOP_WORKER_CONCURRENCY") {
        deep_merge(&mut root, &json!({ "worker": { "concurrency": concurrency } }));
    }
    if let Some(ttl) = number("RUNLOOP_LOCK_TTL_MS") {
        deep_merge(&mut root, &json!({ "lock": { "ttl_ms": ttl } }));
    }
    if let Some(renew) = number("RUNLOOP_LOCK_RENEW_MS") {
        deep_merge(&mut root, &json!({ "lock": { "renew_interval_ms": renew } }));
    }
    if let Some(max) = number("RUNLOOP_MAX_ITERATIONS") {
        deep_merge(&mut root, &json!({ "orchestrator": { "max_iterations": max } }));
    }
    if let Some(provider) = var("RUNLOOP_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider }));
    }
    if let Some(model) = var("RUNLOOP_MODEL") {
        deep_merge(&mut root, &json!({ "orchestrator": { "model_id": model } }));
    }
    if let Some(policy) = var("RUNLOOP_RECLAIM_POLICY") {
        let policy = match policy.trim().to_ascii_lowercase().as_str() {
            "requeue" => json!({
                "kind": "requeue",
                "max_attempts": number("RUNLOOP_RECLAIM_MAX_ATTEMPTS").unwrap_or(3),
            }),
            _ => json!({ "kind": "mark_failed" }),
        };
        deep_merge(&mut root, &json!({ "reaper": { "policy": policy } }));
    }
    for (provider, key_env) in [
        ("openai", "OPENAI_API_KEY"),
        ("openrouter", "OPENROUTER_API_KEY"),
        ("groq", "GROQ_API_KEY"),
        ("mistral", "MISTRAL_API_KEY"),
    ] {
        if let Some(api_key) = var(key_env) {
            deep_merge(
                &mut root,
                &json!({ "providers": { provider: { "api_key": api_key } } }),
            );
        }
    }
    if let Some(url) = var("OLLAMA_URL") {
        deep_merge(&mut root, &json!({ "providers": { "ollama": { "url": url } } }));
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

use crate::policy::HttpPolicyEvaluator;
use crate::queue::{self, EventQueue, EventReceiver};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stagehand_core::adviser::AdviserRegistry;
use stagehand_core::dispatcher::{NodeExecutionEventDispatcher, ProcessorRegistry, StepRegistry};
use stagehand_core::expression::ExpressionEvaluatorProvider;
use stagehand_core::facilitator::FacilitatorRegistry;
use stagehand_core::governance::{GovernanceGate, StaticFeatureFlags, GOVERNANCE_FEATURE_FLAG};
use stagehand_core::notify::{NotifyHub, DEFAULT_BUFFER_CAPACITY, DEFAULT_BUFFER_TTL};
use stagehand_core::stage::StageExecutionInfoService;
use stagehand_core::storage::RedbExecutionStore;
use stagehand_core::types::Ambiance;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub worker: WorkerPoolConfig,

    #[serde(default)]
    pub governance: GovernanceConfig,

    #[serde(default)]
    pub expressions: ExpressionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpressionConfig {
    /// Extra `alias = "GROUP"` prefixes on top of `stage` and `pipeline`
    #[serde(default)]
    pub group_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "executions.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks consuming the event queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the notify endpoint waits for a response
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,

    /// How long an unclaimed response stays claimable
    #[serde(default = "default_notify_buffer_ttl_secs")]
    pub notify_buffer_ttl_secs: u64,

    #[serde(default = "default_notify_buffer_capacity")]
    pub notify_buffer_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_notify_timeout_secs() -> u64 {
    30
}

fn default_notify_buffer_ttl_secs() -> u64 {
    DEFAULT_BUFFER_TTL.as_secs()
}

fn default_notify_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            notify_timeout_secs: default_notify_timeout_secs(),
            notify_buffer_ttl_secs: default_notify_buffer_ttl_secs(),
            notify_buffer_capacity: default_notify_buffer_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Accounts governance applies to; empty means all
    #[serde(default)]
    pub enabled_accounts: Vec<String>,

    /// Policy engine evaluation URL
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_governance_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_governance_timeout_secs() -> u64 {
    10
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enabled_accounts: Vec::new(),
            endpoint: None,
            timeout_secs: default_governance_timeout_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                worker: Default::default(),
                governance: Default::default(),
                expressions: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the execution store path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.notify_timeout_secs)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub notify_hub: Arc<NotifyHub>,
    pub queue: EventQueue,
    pub dispatcher: Arc<NodeExecutionEventDispatcher>,
    pub notify_timeout: Duration,
}

impl AppState {
    /// Build the engine. The returned receiver feeds the worker pool.
    pub fn new(config: &WorkerConfig, steps: StepRegistry) -> Result<(Self, EventReceiver)> {
        let store = Arc::new(
            RedbExecutionStore::new(config.index_path())
                .context("Failed to create execution store")?,
        );
        let notify_hub = Arc::new(NotifyHub::with_limits(
            Duration::from_secs(config.worker.notify_buffer_ttl_secs),
            config.worker.notify_buffer_capacity,
        ));

        if steps.is_empty() {
            tracing::warn!("No step types registered, START events will fail");
        }
        let processors = ProcessorRegistry::with_defaults(Arc::new(steps));

        let mut dispatcher = NodeExecutionEventDispatcher::new(
            store.clone(),
            Arc::new(FacilitatorRegistry::with_defaults()),
            Arc::new(AdviserRegistry::with_defaults()),
            Arc::new(processors),
            notify_hub.clone(),
        )
        .with_stage_service(Arc::new(StageExecutionInfoService::new(store.clone())))
        .with_evaluators(build_evaluators(store.clone(), &config.expressions)?);

        if let Some(gate) = build_governance(&config.governance)? {
            dispatcher = dispatcher.with_governance(Arc::new(gate));
        }

        let (queue, receiver) = queue::channel(config.worker.queue_capacity);

        Ok((
            Self {
                notify_hub,
                queue,
                dispatcher: Arc::new(dispatcher),
                notify_timeout: config.notify_timeout(),
            },
            receiver,
        ))
    }
}

fn build_evaluators(
    store: Arc<RedbExecutionStore>,
    config: &ExpressionConfig,
) -> Result<ExpressionEvaluatorProvider> {
    let provider = config
        .group_aliases
        .iter()
        .fold(ExpressionEvaluatorProvider::new(store), |provider, (alias, group)| {
            provider.with_group_alias(alias.clone(), group.clone())
        });
    // Aliases are applied per evaluator; reject bad ones at startup
    provider
        .evaluator(Ambiance::default())
        .context("Invalid expression group alias")?;
    Ok(provider)
}

fn build_governance(config: &GovernanceConfig) -> Result<Option<GovernanceGate>> {
    if !config.enabled {
        return Ok(None);
    }
    let endpoint = config
        .endpoint
        .clone()
        .context("Governance is enabled but no policy endpoint is configured")?;

    tracing::info!("Policy governance enabled, evaluating against {}", endpoint);
    let evaluator = HttpPolicyEvaluator::new(endpoint, Duration::from_secs(config.timeout_secs))?;
    let flags = StaticFeatureFlags::new()
        .enable(GOVERNANCE_FEATURE_FLAG)
        .for_accounts(config.enabled_accounts.iter().cloned());

    Ok(Some(GovernanceGate::new(Arc::new(evaluator), Arc::new(flags))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = WorkerConfig::load(&dir.path().join("missing.toml"), dir.path().to_path_buf())
            .unwrap();
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.notify_buffer_ttl_secs, 300);
        assert_eq!(config.worker.notify_buffer_capacity, 1024);
        assert_eq!(config.index_path(), dir.path().join("executions.redb"));
        assert!(!config.governance.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[worker]\nconcurrency = 8\nnotify_buffer_capacity = 64\n\n[governance]\n\
             enabled = true\nendpoint = \"http://opa:8181/v1/evaluate\"\n\
             enabled_accounts = [\"acc\"]\n\n[expressions.group_aliases]\nbuild = \"STAGE\""
        )
        .unwrap();

        let config = WorkerConfig::load(file.path(), dir.path().to_path_buf()).unwrap();
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.queue_capacity, 1024);
        assert_eq!(config.worker.notify_buffer_capacity, 64);
        assert_eq!(config.expressions.group_aliases["build"], "STAGE");
        assert_eq!(config.governance.enabled_accounts, vec!["acc".to_string()]);
        assert_eq!(config.governance.timeout_secs, 10);
        assert_eq!(config.storage.index_file, "executions.redb");
    }

    #[test]
    fn test_reserved_group_alias_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config =
            WorkerConfig::load(&dir.path().join("missing.toml"), dir.path().to_path_buf())
                .unwrap();
        config
            .expressions
            .group_aliases
            .insert("outcome".to_string(), "STAGE".to_string());

        let err = AppState::new(&config, StepRegistry::new()).err().unwrap();
        assert!(err.to_string().contains("group alias"));
    }

    #[test]
    fn test_governance_requires_endpoint() {
        let config = GovernanceConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(build_governance(&config).is_err());
        assert!(build_governance(&GovernanceConfig::default()).unwrap().is_none());
    }
}

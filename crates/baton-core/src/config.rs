use std::path::Path;
use std::str::FromStr;

use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Serialize};

use crate::error::{BatonError, Result};
use crate::types::{ConsensusAlgorithm, Priority};

/// Shell commands fired around handoff attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_handoff_start: Vec<String>,
    #[serde(default)]
    pub on_handoff_complete: Vec<String>,
    #[serde(default)]
    pub on_handoff_error: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_handoff_start.is_empty()
            && self.on_handoff_complete.is_empty()
            && self.on_handoff_error.is_empty()
    }
}

/// Top-level Baton configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

/// How a handoff target is chosen among candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSelectionAlgorithm {
    ConfidenceBased,
    WorkloadBased,
    #[default]
    Hybrid,
}

/// Where the workload signal used during selection comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    #[default]
    LeastConnections,
    Weighted,
}

/// Vetted starting points for [`HandoffConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Development,
    Production,
    HighPerformance,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Development, Preset::Production, Preset::HighPerformance];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::HighPerformance => "high_performance",
        }
    }
}

impl FromStr for Preset {
    type Err = BatonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "high_performance" | "highperformance" => Ok(Self::HighPerformance),
            other => Err(BatonError::Config(format!("Unknown preset: {}", other))),
        }
    }
}

/// Process-wide handoff tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Ask the LLM evaluator before falling back to the capability router.
    #[serde(default = "default_true")]
    pub enable_llm_evaluation: bool,
    /// Evaluator verdicts below this confidence defer to the capability router.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Minimum verdict confidence for a handoff to happen at all.
    #[serde(default = "default_minimum_confidence")]
    pub minimum_confidence_for_handoff: f64,
    /// Maximum handoffs per task, bounding delegation chains.
    #[serde(default = "default_max_handoff_depth")]
    pub max_handoff_depth: u32,
    #[serde(default)]
    pub agent_selection_algorithm: AgentSelectionAlgorithm,
    #[serde(default)]
    pub load_balancing_strategy: LoadBalancingStrategy,
    #[serde(default = "default_max_concurrent_handoffs")]
    pub max_concurrent_handoffs: usize,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub enable_circuit_breaker: bool,
    #[serde(default = "default_circuit_breaker_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_timeout_ms")]
    pub circuit_breaker_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_fallback_mechanisms: bool,
    /// After the external agent fails, try a router-selected internal agent.
    #[serde(default = "default_true")]
    pub fallback_to_router_on_external_error: bool,
    /// After the router fallback fails, keep the task on the current agent.
    #[serde(default = "default_true")]
    pub fallback_to_local_agents_on_router_error: bool,
    #[serde(default = "default_true")]
    pub enable_consensus_escalation: bool,
    /// Candidates whose confidences differ by less than this are a disagreement.
    #[serde(default = "default_disagreement_margin")]
    pub disagreement_margin: f64,
    #[serde(default = "default_consensus_algorithm")]
    pub consensus_algorithm: ConsensusAlgorithm,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default = "default_latency_target_ms")]
    pub latency_target_ms: u64,
    #[serde(default = "default_latency_history_size")]
    pub latency_history_size: usize,
    #[serde(default)]
    pub handoff_priority: Priority,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            enable_llm_evaluation: true,
            confidence_threshold: default_confidence_threshold(),
            minimum_confidence_for_handoff: default_minimum_confidence(),
            max_handoff_depth: default_max_handoff_depth(),
            agent_selection_algorithm: AgentSelectionAlgorithm::default(),
            load_balancing_strategy: LoadBalancingStrategy::default(),
            max_concurrent_handoffs: default_max_concurrent_handoffs(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: true,
            max_retry_delay_ms: default_max_retry_delay_ms(),
            enable_circuit_breaker: true,
            circuit_breaker_failure_threshold: default_circuit_breaker_failure_threshold(),
            circuit_breaker_timeout_ms: default_circuit_breaker_timeout_ms(),
            enable_fallback_mechanisms: true,
            fallback_to_router_on_external_error: true,
            fallback_to_local_agents_on_router_error: true,
            enable_consensus_escalation: true,
            disagreement_margin: default_disagreement_margin(),
            consensus_algorithm: default_consensus_algorithm(),
            consensus_threshold: default_consensus_threshold(),
            latency_target_ms: default_latency_target_ms(),
            latency_history_size: default_latency_history_size(),
            handoff_priority: Priority::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_true() -> bool { true }
fn default_confidence_threshold() -> f64 { 0.8 }
fn default_minimum_confidence() -> f64 { 0.6 }
fn default_max_handoff_depth() -> u32 { 3 }
fn default_max_concurrent_handoffs() -> usize { 50 }
fn default_max_retry_attempts() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_max_retry_delay_ms() -> u64 { 30_000 }
fn default_circuit_breaker_failure_threshold() -> u32 { 5 }
fn default_circuit_breaker_timeout_ms() -> u64 { 60_000 }
fn default_disagreement_margin() -> f64 { 0.1 }
fn default_consensus_algorithm() -> ConsensusAlgorithm { ConsensusAlgorithm::WeightedMajority }
fn default_consensus_threshold() -> f64 { 0.67 }
fn default_latency_target_ms() -> u64 { 2000 }
fn default_latency_history_size() -> usize { 100 }
fn default_log_level() -> String { "info".to_string() }

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Upper bound on `max_concurrent_handoffs`. Kept well under what a
/// `tokio::sync::Semaphore` can hold so resizing never overflows it.
pub const MAX_CONCURRENT_HANDOFFS: usize = 1_000_000;

impl HandoffConfig {
    /// Build the config for a named preset.
    pub fn preset(preset: Preset) -> Self {
        let base = Self::default();
        match preset {
            Preset::Development => Self {
                max_concurrent_handoffs: 5,
                max_retry_attempts: 1,
                retry_delay_ms: 100,
                exponential_backoff: false,
                circuit_breaker_failure_threshold: 3,
                circuit_breaker_timeout_ms: 5_000,
                latency_target_ms: 5_000,
                log_level: "debug".to_string(),
                ..base
            },
            Preset::Production => base,
            Preset::HighPerformance => Self {
                agent_selection_algorithm: AgentSelectionAlgorithm::WorkloadBased,
                max_concurrent_handoffs: 200,
                max_retry_attempts: 2,
                retry_delay_ms: 50,
                max_retry_delay_ms: 1_000,
                circuit_breaker_failure_threshold: 10,
                circuit_breaker_timeout_ms: 10_000,
                enable_consensus_escalation: false,
                latency_target_ms: 500,
                handoff_priority: Priority::High,
                log_level: "warn".to_string(),
                ..base
            },
        }
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Overlay `BATON_*` environment variables onto this config.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary key lookup (environment-style names).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        macro_rules! overlay {
            ($field:ident, $key:literal, value) => {
                if let Some(raw) = lookup($key) {
                    self.$field = parse_value($key, &raw)?;
                }
            };
            ($field:ident, $key:literal, variant) => {
                if let Some(raw) = lookup($key) {
                    self.$field = parse_variant($key, &raw)?;
                }
            };
        }

        if let Some(raw) = lookup("BATON_PRESET") {
            self = Self::preset(raw.parse()?);
        }

        overlay!(enable_llm_evaluation, "BATON_ENABLE_LLM_EVALUATION", value);
        overlay!(confidence_threshold, "BATON_CONFIDENCE_THRESHOLD", value);
        overlay!(minimum_confidence_for_handoff, "BATON_MINIMUM_CONFIDENCE_FOR_HANDOFF", value);
        overlay!(max_handoff_depth, "BATON_MAX_HANDOFF_DEPTH", value);
        overlay!(agent_selection_algorithm, "BATON_AGENT_SELECTION_ALGORITHM", variant);
        overlay!(load_balancing_strategy, "BATON_LOAD_BALANCING_STRATEGY", variant);
        overlay!(max_concurrent_handoffs, "BATON_MAX_CONCURRENT_HANDOFFS", value);
        overlay!(max_retry_attempts, "BATON_MAX_RETRY_ATTEMPTS", value);
        overlay!(retry_delay_ms, "BATON_RETRY_DELAY_MS", value);
        overlay!(exponential_backoff, "BATON_EXPONENTIAL_BACKOFF", value);
        overlay!(max_retry_delay_ms, "BATON_MAX_RETRY_DELAY_MS", value);
        overlay!(enable_circuit_breaker, "BATON_ENABLE_CIRCUIT_BREAKER", value);
        overlay!(circuit_breaker_failure_threshold, "BATON_CIRCUIT_BREAKER_FAILURE_THRESHOLD", value);
        overlay!(circuit_breaker_timeout_ms, "BATON_CIRCUIT_BREAKER_TIMEOUT_MS", value);
        overlay!(enable_fallback_mechanisms, "BATON_ENABLE_FALLBACK_MECHANISMS", value);
        overlay!(fallback_to_router_on_external_error, "BATON_FALLBACK_TO_ROUTER_ON_EXTERNAL_ERROR", value);
        overlay!(fallback_to_local_agents_on_router_error, "BATON_FALLBACK_TO_LOCAL_AGENTS_ON_ROUTER_ERROR", value);
        overlay!(enable_consensus_escalation, "BATON_ENABLE_CONSENSUS_ESCALATION", value);
        overlay!(disagreement_margin, "BATON_DISAGREEMENT_MARGIN", value);
        overlay!(consensus_algorithm, "BATON_CONSENSUS_ALGORITHM", variant);
        overlay!(consensus_threshold, "BATON_CONSENSUS_THRESHOLD", value);
        overlay!(latency_target_ms, "BATON_LATENCY_TARGET_MS", value);
        overlay!(latency_history_size, "BATON_LATENCY_HISTORY_SIZE", value);
        overlay!(handoff_priority, "BATON_HANDOFF_PRIORITY", variant);
        overlay!(log_level, "BATON_LOG_LEVEL", value);

        Ok(self)
    }

    /// Every rule the config violates. Empty means valid.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            issues.push("confidence_threshold must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.minimum_confidence_for_handoff) {
            issues.push("minimum_confidence_for_handoff must be within [0, 1]".to_string());
        }
        if self.max_handoff_depth == 0 {
            issues.push("max_handoff_depth must be at least 1".to_string());
        }
        if self.max_concurrent_handoffs == 0 {
            issues.push("max_concurrent_handoffs must be at least 1".to_string());
        } else if self.max_concurrent_handoffs > MAX_CONCURRENT_HANDOFFS {
            issues.push(format!(
                "max_concurrent_handoffs must not exceed {}",
                MAX_CONCURRENT_HANDOFFS
            ));
        }
        if self.max_retry_attempts == 0 {
            issues.push("max_retry_attempts must be at least 1".to_string());
        }
        if self.exponential_backoff && self.max_retry_delay_ms < self.retry_delay_ms {
            issues.push("max_retry_delay_ms must not be below retry_delay_ms".to_string());
        }
        if self.enable_circuit_breaker {
            if self.circuit_breaker_failure_threshold == 0 {
                issues.push("circuit_breaker_failure_threshold must be at least 1".to_string());
            }
            if self.circuit_breaker_timeout_ms == 0 {
                issues.push("circuit_breaker_timeout_ms must be positive".to_string());
            }
        }
        if !(0.0..=1.0).contains(&self.disagreement_margin) {
            issues.push("disagreement_margin must be within [0, 1]".to_string());
        }
        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            issues.push("consensus_threshold must be within (0, 1]".to_string());
        }
        if self.latency_target_ms == 0 {
            issues.push("latency_target_ms must be positive".to_string());
        }
        if self.latency_history_size == 0 {
            issues.push("latency_history_size must be at least 1".to_string());
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            issues.push(format!(
                "log_level must be one of {}, got '{}'",
                LOG_LEVELS.join("/"),
                self.log_level
            ));
        }

        issues
    }

    pub fn validate(&self) -> Result<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(BatonError::ConfigValidation(issues))
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| BatonError::Config(format!("{}: {}", key, e)))
}

fn parse_variant<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    let normalized = raw.trim().to_lowercase();
    T::deserialize(normalized.as_str().into_deserializer())
        .map_err(|e: serde::de::value::Error| BatonError::Config(format!("{}: {}", key, e)))
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BatonError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| BatonError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference when the variable is unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_BATON_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_BATON_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_BATON_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_BATON_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_BATON_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.handoff, HandoffConfig::default());
        assert!(config.hooks.is_none());
        assert_eq!(config.handoff.max_retry_attempts, 3);
        assert_eq!(config.handoff.consensus_algorithm, ConsensusAlgorithm::WeightedMajority);
    }

    #[test]
    fn test_partial_handoff_section() {
        let toml_str = r#"
[handoff]
max_retry_attempts = 5
agent_selection_algorithm = "workload_based"
consensus_algorithm = "supermajority"
handoff_priority = "high"

[hooks]
on_handoff_error = ["echo failed"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.handoff.max_retry_attempts, 5);
        assert_eq!(
            config.handoff.agent_selection_algorithm,
            AgentSelectionAlgorithm::WorkloadBased
        );
        assert_eq!(config.handoff.consensus_algorithm, ConsensusAlgorithm::Supermajority);
        assert_eq!(config.handoff.handoff_priority, Priority::High);
        assert_eq!(config.handoff.retry_delay_ms, 1000);
        let hooks = config.hooks.unwrap();
        assert!(!hooks.is_empty());
        assert_eq!(hooks.on_handoff_error, vec!["echo failed"]);
    }

    #[test]
    fn test_presets_are_valid() {
        for preset in Preset::ALL {
            let config = HandoffConfig::preset(preset);
            assert!(config.validate().is_ok(), "{} preset invalid", preset.name());
        }
        assert_eq!(HandoffConfig::preset(Preset::Production), HandoffConfig::default());
        assert_eq!(HandoffConfig::preset(Preset::Development).log_level, "debug");
        assert_eq!(
            HandoffConfig::preset(Preset::HighPerformance).max_concurrent_handoffs,
            200
        );
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!("dev".parse::<Preset>().unwrap(), Preset::Development);
        assert_eq!("high-performance".parse::<Preset>().unwrap(), Preset::HighPerformance);
        assert!("staging".parse::<Preset>().is_err());
    }

    #[test]
    fn test_validation_collects_every_issue() {
        let config = HandoffConfig {
            confidence_threshold: 1.5,
            max_retry_attempts: 0,
            consensus_threshold: 0.0,
            log_level: "loud".to_string(),
            ..HandoffConfig::default()
        };
        match config.validate() {
            Err(BatonError::ConfigValidation(issues)) => {
                assert_eq!(issues.len(), 4);
                assert!(issues.iter().any(|i| i.starts_with("confidence_threshold")));
                assert!(issues.iter().any(|i| i.starts_with("log_level")));
            }
            other => panic!("expected ConfigValidation, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrency_cap_is_bounded() {
        let at_cap = HandoffConfig {
            max_concurrent_handoffs: MAX_CONCURRENT_HANDOFFS,
            ..HandoffConfig::default()
        };
        assert!(at_cap.validate().is_ok());

        let huge = HandoffConfig {
            max_concurrent_handoffs: 1 << 62,
            ..HandoffConfig::default()
        };
        let issues = huge.issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("max_concurrent_handoffs must not exceed"));
    }

    #[test]
    fn test_backoff_bounds_only_checked_when_exponential() {
        let config = HandoffConfig {
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 1_000,
            exponential_backoff: false,
            ..HandoffConfig::default()
        };
        assert!(config.validate().is_ok());
        let config = HandoffConfig {
            exponential_backoff: true,
            ..config
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("BATON_PRESET", "development"),
            ("BATON_MAX_RETRY_ATTEMPTS", "4"),
            ("BATON_LOAD_BALANCING_STRATEGY", "round_robin"),
            ("BATON_CONSENSUS_ALGORITHM", "Simple-Majority"),
            ("BATON_ENABLE_CIRCUIT_BREAKER", "false"),
        ]);
        let config = HandoffConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_retry_attempts, 4);
        assert_eq!(config.load_balancing_strategy, LoadBalancingStrategy::RoundRobin);
        assert_eq!(config.consensus_algorithm, ConsensusAlgorithm::SimpleMajority);
        assert!(!config.enable_circuit_breaker);
    }

    #[test]
    fn test_override_parse_error_names_key() {
        let err = HandoffConfig::default()
            .with_overrides(|k| (k == "BATON_RETRY_DELAY_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BATON_RETRY_DELAY_MS"));
    }
}

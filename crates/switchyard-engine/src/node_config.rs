//! Typed per-node-type configuration.
//!
//! Node config arrives as an opaque JSON object. [`NodeConfig::parse`] splits
//! it into the keys every node understands (fan-in and retention) and the
//! keys owned by the node's type, deserializes each half strictly, and then
//! checks the cross-field rules. Unknown keys are rejected, so an accepted
//! config serializes back to the same object via [`NodeConfig::to_value`].

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifacts::RetentionPolicy;
use crate::graph::NodeType;

const COMMON_KEYS: &[&str] = &[
    "fan_in_mode",
    "fan_in_custom_count",
    "retention_mode",
    "retention_ttl_seconds",
    "retention_max_count",
];

const MAX_RETRIEVE_LIMIT: u32 = 100;
const MAX_TOP_K: u32 = 50;

fn source_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").expect("static regex compiles")
    })
}

// ---------------------------------------------------------------------------
// Shared knobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInKind {
    All,
    Any,
    Custom,
}

/// How many distinct solid parents must arrive before a node becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanInMode {
    All,
    Any,
    Custom(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    Forever,
    Ttl,
    MaxCount,
    TtlMaxCount,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_in_mode: Option<FanInKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_in_custom_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_mode: Option<RetentionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_max_count: Option<u32>,
}

impl CommonConfig {
    fn check(&self, errors: &mut Vec<String>) {
        match (self.fan_in_mode, self.fan_in_custom_count) {
            (Some(FanInKind::Custom), None) => {
                errors.push("fan_in_custom_count is required when fan_in_mode is 'custom'".into())
            }
            (Some(FanInKind::Custom), Some(0)) => {
                errors.push("fan_in_custom_count must be at least 1".into())
            }
            (Some(FanInKind::Custom), Some(_)) => {}
            (_, Some(_)) => {
                errors.push("fan_in_custom_count is only allowed when fan_in_mode is 'custom'".into())
            }
            _ => {}
        }

        let mode = self.retention_mode.unwrap_or(RetentionMode::Forever);
        let wants_ttl = matches!(mode, RetentionMode::Ttl | RetentionMode::TtlMaxCount);
        let wants_count = matches!(mode, RetentionMode::MaxCount | RetentionMode::TtlMaxCount);
        match (wants_ttl, self.retention_ttl_seconds) {
            (true, None) => errors.push("retention_ttl_seconds is required for this retention_mode".into()),
            (true, Some(0)) => errors.push("retention_ttl_seconds must be at least 1".into()),
            (false, Some(_)) => {
                errors.push("retention_ttl_seconds is only allowed with ttl retention modes".into())
            }
            _ => {}
        }
        match (wants_count, self.retention_max_count) {
            (true, None) => errors.push("retention_max_count is required for this retention_mode".into()),
            (true, Some(0)) => errors.push("retention_max_count must be at least 1".into()),
            (false, Some(_)) => {
                errors.push("retention_max_count is only allowed with max_count retention modes".into())
            }
            _ => {}
        }
    }

    pub fn fan_in(&self) -> FanInMode {
        match self.fan_in_mode {
            Some(FanInKind::Any) => FanInMode::Any,
            Some(FanInKind::Custom) => FanInMode::Custom(self.fan_in_custom_count.unwrap_or(1)),
            _ => FanInMode::All,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        let ttl_seconds = self.retention_ttl_seconds.unwrap_or(1);
        let max_count = self.retention_max_count.unwrap_or(1);
        match self.retention_mode.unwrap_or(RetentionMode::Forever) {
            RetentionMode::Forever => RetentionPolicy::Forever,
            RetentionMode::Ttl => RetentionPolicy::Ttl { ttl_seconds },
            RetentionMode::MaxCount => RetentionPolicy::MaxCount { max_count },
            RetentionMode::TtlMaxCount => RetentionPolicy::TtlMaxCount {
                ttl_seconds,
                max_count,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Per-type configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyConfig {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    #[default]
    Fail,
    Fallback,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_match_policy: Option<NoMatchPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_condition_key: Option<String>,
}

impl DecisionConfig {
    pub fn policy(&self) -> NoMatchPolicy {
        self.no_match_policy.unwrap_or_default()
    }

    /// The trimmed fallback key, only when the policy actually falls back.
    pub fn fallback_key(&self) -> Option<&str> {
        match self.policy() {
            NoMatchPolicy::Fallback => self
                .fallback_condition_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty()),
            NoMatchPolicy::Fail => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    #[default]
    CreateOrUpdate,
    CompletePlanItem,
    Read,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PlanAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_source_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneAction {
    #[default]
    CreateOrUpdate,
    MarkComplete,
    Read,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MilestoneConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<MilestoneAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_source_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAction {
    #[default]
    Add,
    Retrieve,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<MemoryAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieve_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KindConfig {
    Start,
    End,
    Task(TaskConfig),
    Decision(DecisionConfig),
    Plan(PlanConfig),
    Milestone(MilestoneConfig),
    Memory(MemoryConfig),
    Retrieval(RetrievalConfig),
    Subflow,
}

/// Fully typed node configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub common: CommonConfig,
    pub kind: KindConfig,
}

fn parse_part<T: DeserializeOwned + Default>(
    part: Map<String, Value>,
    errors: &mut Vec<String>,
) -> T {
    serde_json::from_value(Value::Object(part)).unwrap_or_else(|err| {
        errors.push(err.to_string());
        T::default()
    })
}

fn check_source_path(path: Option<&str>, required: bool, errors: &mut Vec<String>) {
    match path.map(str::trim) {
        None | Some("") if required => {
            errors.push("completion_source_path is required for this action".into())
        }
        Some(p) if !p.is_empty() && !source_path_regex().is_match(p) => errors.push(format!(
            "completion_source_path '{p}' must be a dotted path like 'output.items'"
        )),
        _ => {}
    }
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl NodeConfig {
    /// Parse and sanitize a raw config for the given node type.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn parse(node_type: NodeType, raw: &Value) -> Result<Self, Vec<String>> {
        let object = match raw {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(vec![format!(
                    "config must be a JSON object, got {}",
                    json_kind(other)
                )])
            }
        };

        let (common_part, kind_part): (Map<_, _>, Map<_, _>) = object
            .into_iter()
            .partition(|(k, _)| COMMON_KEYS.contains(&k.as_str()));

        let mut errors = Vec::new();
        let common: CommonConfig = parse_part(common_part, &mut errors);
        if errors.is_empty() {
            common.check(&mut errors);
        }

        let kind_errors_before = errors.len();
        let kind = match node_type {
            NodeType::Start => {
                parse_part::<EmptyConfig>(kind_part, &mut errors);
                KindConfig::Start
            }
            NodeType::End => {
                parse_part::<EmptyConfig>(kind_part, &mut errors);
                KindConfig::End
            }
            NodeType::Subflow => {
                parse_part::<EmptyConfig>(kind_part, &mut errors);
                KindConfig::Subflow
            }
            NodeType::Task => {
                let cfg: TaskConfig = parse_part(kind_part, &mut errors);
                if cfg.timeout_seconds == Some(0) {
                    errors.push("timeout_seconds must be at least 1".into());
                }
                KindConfig::Task(cfg)
            }
            NodeType::Decision => {
                let cfg: DecisionConfig = parse_part(kind_part, &mut errors);
                if errors.len() == kind_errors_before
                    && cfg.policy() == NoMatchPolicy::Fallback
                    && cfg.fallback_key().is_none()
                {
                    errors.push(
                        "fallback_condition_key is required when no_match_policy is 'fallback'"
                            .into(),
                    );
                }
                KindConfig::Decision(cfg)
            }
            NodeType::Plan => {
                let cfg: PlanConfig = parse_part(kind_part, &mut errors);
                if errors.len() == kind_errors_before {
                    let required = cfg.action == Some(PlanAction::CompletePlanItem);
                    check_source_path(cfg.completion_source_path.as_deref(), required, &mut errors);
                }
                KindConfig::Plan(cfg)
            }
            NodeType::Milestone => {
                let cfg: MilestoneConfig = parse_part(kind_part, &mut errors);
                if errors.len() == kind_errors_before {
                    let required = cfg.action == Some(MilestoneAction::MarkComplete);
                    check_source_path(cfg.completion_source_path.as_deref(), required, &mut errors);
                }
                KindConfig::Milestone(cfg)
            }
            NodeType::Memory => {
                let cfg: MemoryConfig = parse_part(kind_part, &mut errors);
                if let Some(limit) = cfg.retrieve_limit {
                    if !(1..=MAX_RETRIEVE_LIMIT).contains(&limit) {
                        errors.push(format!(
                            "retrieve_limit must be between 1 and {MAX_RETRIEVE_LIMIT}"
                        ));
                    }
                }
                KindConfig::Memory(cfg)
            }
            NodeType::Retrieval => {
                let cfg: RetrievalConfig = parse_part(kind_part, &mut errors);
                if let Some(top_k) = cfg.top_k {
                    if !(1..=MAX_TOP_K).contains(&top_k) {
                        errors.push(format!("top_k must be between 1 and {MAX_TOP_K}"));
                    }
                }
                KindConfig::Retrieval(cfg)
            }
        };

        if errors.is_empty() {
            Ok(NodeConfig { common, kind })
        } else {
            Err(errors)
        }
    }

    /// The canonical JSON object for this config.
    pub fn to_value(&self) -> Value {
        let mut object = to_object(&self.common);
        let kind = match &self.kind {
            KindConfig::Start | KindConfig::End | KindConfig::Subflow => Map::new(),
            KindConfig::Task(cfg) => to_object(cfg),
            KindConfig::Decision(cfg) => to_object(cfg),
            KindConfig::Plan(cfg) => to_object(cfg),
            KindConfig::Milestone(cfg) => to_object(cfg),
            KindConfig::Memory(cfg) => to_object(cfg),
            KindConfig::Retrieval(cfg) => to_object(cfg),
        };
        object.extend(kind);
        Value::Object(object)
    }

    pub fn fan_in(&self) -> FanInMode {
        self.common.fan_in()
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.common.retention()
    }

    pub fn decision(&self) -> Option<&DecisionConfig> {
        match &self.kind {
            KindConfig::Decision(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn task_prompt(&self) -> Option<&str> {
        match &self.kind {
            KindConfig::Task(cfg) => cfg.prompt.as_deref(),
            _ => None,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

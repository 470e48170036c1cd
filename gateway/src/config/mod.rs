//! Filter configuration: model routing rules and load-balancing settings.
//!
//! The proxy host hands the filter an opaque JSON blob; [`FilterConfig`]
//! deserializes it and [`FilterConfig::build`] validates it into the
//! read-only [`RouteTable`] used on the request path. Validation failures are
//! fatal: the filter refuses to activate on an invalid rule set.

use std::{collections::HashMap, fmt, str::FromStr};

use http::HeaderMap;
use serde::Deserialize;
use thiserror::Error;

/// Backend engine protocol behind a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    Vllm,
    Sglang,
    Tensorrt,
    #[default]
    Triton,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Vllm => "vllm",
            Backend::Sglang => "sglang",
            Backend::Tensorrt => "tensorrt",
            Backend::Triton => "triton",
        }
    }
}

impl FromStr for Backend {
    type Err = ();

    /// An empty string maps to the default backend.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vllm" => Ok(Backend::Vllm),
            "sglang" => Ok(Backend::Sglang),
            "tensorrt" => Ok(Backend::Tensorrt),
            "triton" | "" => Ok(Backend::Triton),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("protocol is required")]
    MissingProtocol,

    #[error("model {model}: rules list is empty")]
    EmptyRules { model: String },

    #[error("model {model}: mismatched cluster, current={found}, expected={expected}")]
    MismatchedCluster {
        model: String,
        found: String,
        expected: String,
    },

    #[error("model {model}: mismatched backend, current={found}, expected={expected}")]
    MismatchedBackend {
        model: String,
        found: String,
        expected: String,
    },

    #[error("model {model}: unknown backend {value:?}")]
    UnknownBackend { model: String, value: String },

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raw filter configuration as deserialized from the proxy host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    /// Input protocol tag (`openai`).
    #[serde(default)]
    pub protocol: String,
    /// Load-balancing algorithm tag; empty selects the inference balancer.
    #[serde(default)]
    pub algorithm: String,
    #[serde(default)]
    pub model_mapping_rule: HashMap<String, Rules>,
    #[serde(default)]
    pub lb_mapping_rule: HashMap<String, LbConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Rules {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub scene_name: String,
    #[serde(default)]
    pub chain_name: String,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub route_name: String,
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    #[serde(default)]
    pub subset: Vec<Subset>,
    #[serde(default)]
    pub cluster: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeaderMatch {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Subset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub lora: String,
    #[serde(default)]
    pub weight: i32,
}

/// Per-model load-balancing settings.
///
/// Field defaults apply when a mapping entry omits them; when a model has no
/// mapping at all the awareness flags inherit the Metadata Center's
/// enabled-ness (see `RouteTable::lb_config`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LbConfig {
    #[serde(default)]
    pub load_aware_enable: bool,
    #[serde(default)]
    pub cache_aware_enable: bool,
    #[serde(default = "default_candidate_percent")]
    pub candidate_percent: u32,
    #[serde(default = "default_request_load_weight")]
    pub request_load_weight: u32,
    #[serde(default = "default_prefill_load_weight")]
    pub prefill_load_weight: u32,
    #[serde(default = "default_cache_ratio_weight")]
    pub cache_ratio_weight: u32,
}

fn default_candidate_percent() -> u32 {
    5
}

fn default_request_load_weight() -> u32 {
    1
}

fn default_prefill_load_weight() -> u32 {
    3
}

fn default_cache_ratio_weight() -> u32 {
    2
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            load_aware_enable: false,
            cache_aware_enable: false,
            candidate_percent: default_candidate_percent(),
            request_load_weight: default_request_load_weight(),
            prefill_load_weight: default_prefill_load_weight(),
            cache_ratio_weight: default_cache_ratio_weight(),
        }
    }
}

/// A validated routing rule with precomputed subset selector and LoRA id.
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub scene_name: String,
    pub chain_name: String,
    pub route_name: String,
    pub backend: Backend,
    pub cluster: String,
    pub matchers: Vec<HeaderMatch>,
    pub selector: HashMap<String, String>,
    pub lora_id: Option<String>,
}

/// Rules for one model, sorted by descending header-matcher count so the
/// most specific rule wins.
#[derive(Debug, Clone)]
pub struct ModelMapping {
    pub cluster: String,
    pub backend: Backend,
    rules: Vec<ResolvedRule>,
}

impl ModelMapping {
    /// Pick the first rule whose matchers are all satisfied by the request
    /// headers. A rule without matchers acts as the default fallback.
    pub fn resolve(&self, headers: &HeaderMap) -> Option<&ResolvedRule> {
        if self.rules.len() == 1 && self.rules[0].matchers.is_empty() {
            return Some(&self.rules[0]);
        }

        self.rules.iter().find(|rule| {
            rule.matchers.iter().all(|m| {
                headers
                    .get(m.key.as_str())
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v == m.value)
            })
        })
    }

    pub fn rules(&self) -> &[ResolvedRule] {
        &self.rules
    }
}

/// Validated, read-only routing state shared by all filter instances.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    protocol: String,
    algorithm: String,
    mappings: HashMap<String, ModelMapping>,
    lb: HashMap<String, LbConfig>,
}

impl RouteTable {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn algorithm(&self) -> &str {
        if self.algorithm.is_empty() {
            crate::policies::INFERENCE_LB
        } else {
            &self.algorithm
        }
    }

    pub fn mapping(&self, model: &str) -> Option<&ModelMapping> {
        self.mappings.get(model)
    }

    pub fn has_mappings(&self) -> bool {
        !self.mappings.is_empty()
    }

    pub fn lb_config(&self, model: &str) -> Option<&LbConfig> {
        self.lb.get(model)
    }
}

impl FilterConfig {
    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Validate the configuration and build the routing table.
    pub fn build(self) -> Result<RouteTable, ConfigError> {
        if self.protocol.is_empty() {
            return Err(ConfigError::MissingProtocol);
        }

        let mut mappings = HashMap::with_capacity(self.model_mapping_rule.len());
        for (model, rules) in self.model_mapping_rule {
            let mapping = build_mapping(&model, rules.rules)?;
            mappings.insert(model, mapping);
        }

        Ok(RouteTable {
            protocol: self.protocol,
            algorithm: self.algorithm,
            mappings,
            lb: self.lb_mapping_rule,
        })
    }
}

/// Validate one model's rules: a shared cluster and a shared backend are
/// required across the whole list.
fn build_mapping(model: &str, rules: Vec<Rule>) -> Result<ModelMapping, ConfigError> {
    if rules.is_empty() {
        return Err(ConfigError::EmptyRules {
            model: model.to_string(),
        });
    }

    let expected_cluster = rules[0].cluster.clone();
    let expected_backend = parse_backend(model, &rules[0].backend)?;

    let mut resolved = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.cluster != expected_cluster {
            return Err(ConfigError::MismatchedCluster {
                model: model.to_string(),
                found: rule.cluster,
                expected: expected_cluster,
            });
        }
        let backend = parse_backend(model, &rule.backend)?;
        if backend != expected_backend {
            return Err(ConfigError::MismatchedBackend {
                model: model.to_string(),
                found: backend.to_string(),
                expected: expected_backend.to_string(),
            });
        }

        resolved.push(resolve_rule(rule, backend));
    }

    // Most specific first; ties keep configuration order.
    resolved.sort_by(|a, b| b.matchers.len().cmp(&a.matchers.len()));

    Ok(ModelMapping {
        cluster: expected_cluster,
        backend: expected_backend,
        rules: resolved,
    })
}

fn parse_backend(model: &str, value: &str) -> Result<Backend, ConfigError> {
    value.parse().map_err(|_| ConfigError::UnknownBackend {
        model: model.to_string(),
        value: value.to_string(),
    })
}

fn resolve_rule(rule: Rule, backend: Backend) -> ResolvedRule {
    let mut selector = HashMap::new();
    let mut lora_id = None;
    for subset in &rule.subset {
        if !subset.lora.is_empty() {
            lora_id = Some(subset.lora.clone());
        }
        for (k, v) in &subset.labels {
            selector.insert(k.clone(), v.clone());
        }
    }

    ResolvedRule {
        scene_name: rule.scene_name,
        chain_name: rule.chain_name,
        route_name: rule.route_name,
        backend,
        cluster: rule.cluster,
        matchers: rule.headers,
        selector,
        lora_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(json: &str) -> RouteTable {
        FilterConfig::from_slice(json.as_bytes())
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn missing_protocol_is_fatal() {
        let cfg = FilterConfig::from_slice(b"{}").unwrap();
        assert!(matches!(cfg.build(), Err(ConfigError::MissingProtocol)));
    }

    #[test]
    fn empty_backend_defaults_to_triton() {
        let t = table(
            r#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[{"cluster":"c1"}]}}}"#,
        );
        assert_eq!(t.mapping("m").unwrap().backend, Backend::Triton);
    }

    #[test]
    fn mismatched_cluster_is_rejected() {
        let cfg = FilterConfig::from_slice(
            br#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[
                {"cluster":"c1","backend":"vllm"},
                {"cluster":"c2","backend":"vllm"}
            ]}}}"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.build(),
            Err(ConfigError::MismatchedCluster { .. })
        ));
    }

    #[test]
    fn mismatched_backend_is_rejected() {
        let cfg = FilterConfig::from_slice(
            br#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[
                {"cluster":"c1","backend":"vllm"},
                {"cluster":"c1","backend":"sglang"}
            ]}}}"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.build(),
            Err(ConfigError::MismatchedBackend { .. })
        ));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let cfg = FilterConfig::from_slice(
            br#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[
                {"cluster":"c1","backend":"llamacpp"}
            ]}}}"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.build(),
            Err(ConfigError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn rules_sort_by_matcher_count() {
        let t = table(
            r#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[
                {"cluster":"c1","backend":"vllm","route_name":"default"},
                {"cluster":"c1","backend":"vllm","route_name":"canary",
                 "headers":[{"key":"x-env","value":"canary"},{"key":"x-tier","value":"gold"}]},
                {"cluster":"c1","backend":"vllm","route_name":"env",
                 "headers":[{"key":"x-env","value":"canary"}]}
            ]}}}"#,
        );
        let rules = t.mapping("m").unwrap().rules();
        assert_eq!(rules[0].route_name, "canary");
        assert_eq!(rules[1].route_name, "env");
        assert_eq!(rules[2].route_name, "default");
    }

    #[test]
    fn resolve_picks_most_specific_match() {
        let t = table(
            r#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[
                {"cluster":"c1","route_name":"default"},
                {"cluster":"c1","route_name":"canary","headers":[{"key":"x-env","value":"canary"}]}
            ]}}}"#,
        );
        let mapping = t.mapping("m").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-env", "canary".parse().unwrap());
        assert_eq!(mapping.resolve(&headers).unwrap().route_name, "canary");

        let other = HeaderMap::new();
        assert_eq!(mapping.resolve(&other).unwrap().route_name, "default");
    }

    #[test]
    fn resolve_returns_none_without_fallback() {
        let t = table(
            r#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[
                {"cluster":"c1","route_name":"canary","headers":[{"key":"x-env","value":"canary"}]}
            ]}}}"#,
        );
        let mapping = t.mapping("m").unwrap();
        assert!(mapping.resolve(&HeaderMap::new()).is_none());
    }

    #[test]
    fn subsets_merge_labels_and_lora() {
        let t = table(
            r#"{"protocol":"openai","model_mapping_rule":{"m":{"rules":[
                {"cluster":"c1","subset":[
                    {"name":"s1","labels":{"tier":"gold"}},
                    {"name":"s2","labels":{"zone":"a"},"lora":"sql-lora"}
                ]}
            ]}}}"#,
        );
        let rule = &t.mapping("m").unwrap().rules()[0];
        assert_eq!(rule.selector.get("tier").unwrap(), "gold");
        assert_eq!(rule.selector.get("zone").unwrap(), "a");
        assert_eq!(rule.lora_id.as_deref(), Some("sql-lora"));
    }

    #[test]
    fn lb_config_field_defaults() {
        let cfg: LbConfig =
            serde_json::from_str(r#"{"load_aware_enable":true,"candidate_percent":0}"#).unwrap();
        assert!(cfg.load_aware_enable);
        assert_eq!(cfg.candidate_percent, 0);
        assert_eq!(cfg.request_load_weight, 1);
        assert_eq!(cfg.prefill_load_weight, 3);
        assert_eq!(cfg.cache_ratio_weight, 2);
    }

    #[test]
    fn algorithm_defaults_to_inference_lb() {
        let t = table(r#"{"protocol":"openai"}"#);
        assert_eq!(t.algorithm(), "inference_lb");
    }
}

//! Settings Resolver
//!
//! Per-agent pipeline settings merge: agent overrides beat the agent's
//! semantic level, which beats global overrides, which beat the global
//! semantic level, which beats daemon defaults. The resolved record is
//! snapshotted into a reflection job at start; live edits never affect a
//! running job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel agent id for the global settings document
pub const GLOBAL_AGENT_ID: &str = "_global";

// ============================================================================
// SEMANTIC LEVELS
// ============================================================================

/// Coarse dial controlling how many pipeline stages attempt LLM enhancement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SemanticLevel {
    /// Heuristics only
    #[default]
    Off,
    /// Enhance extraction
    Basic,
    /// Enhance extraction, classification, and entity updates
    Enhanced,
    /// Enhance every enhanceable stage
    Full,
}

impl SemanticLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticLevel::Off => "off",
            SemanticLevel::Basic => "basic",
            SemanticLevel::Enhanced => "enhanced",
            SemanticLevel::Full => "full",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(SemanticLevel::Off),
            "basic" => Some(SemanticLevel::Basic),
            "enhanced" => Some(SemanticLevel::Enhanced),
            "full" => Some(SemanticLevel::Full),
            _ => None,
        }
    }

    /// Expand the level into per-stage toggles
    pub fn expand(&self) -> StageToggles {
        match self {
            SemanticLevel::Off => StageToggles::default(),
            SemanticLevel::Basic => StageToggles {
                extract: true,
                ..Default::default()
            },
            SemanticLevel::Enhanced => StageToggles {
                extract: true,
                classify: true,
                entity_update: true,
                ..Default::default()
            },
            SemanticLevel::Full => StageToggles {
                extract: true,
                classify: true,
                entity_update: true,
                graph_link: true,
                layer_promote: true,
            },
        }
    }
}

// ============================================================================
// STAGE TOGGLES
// ============================================================================

/// Resolved per-stage `useLlm` booleans for the five enhanceable stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageToggles {
    pub extract: bool,
    pub classify: bool,
    pub entity_update: bool,
    pub graph_link: bool,
    pub layer_promote: bool,
}

/// Per-stage overrides as stored; `None` defers to the next layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_link: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_promote: Option<bool>,
}

// ============================================================================
// LLM PROVIDER
// ============================================================================

/// LLM provider configuration used by LLM-enhanced stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmProviderConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: String::new(),
            temperature: 0.2,
            max_tokens: 1024,
            timeout_ms: 15_000,
        }
    }
}

// ============================================================================
// SETTINGS DOCUMENTS
// ============================================================================

/// Stored settings for one agent (or the `_global` sentinel)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDoc {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_level: Option<SemanticLevel>,
    #[serde(default)]
    pub stages: StageOverrides,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmProviderConfig>,
    /// Promote archival candidates automatically during reflection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_promote_layers: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Process-level defaults, the lowest-precedence layer
#[derive(Debug, Clone, Default)]
pub struct DaemonDefaults {
    pub semantic_level: SemanticLevel,
    pub llm: LlmProviderConfig,
    pub auto_promote_layers: bool,
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Fully resolved pipeline settings, snapshotted per job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPipelineSettings {
    pub stages: StageToggles,
    pub llm: LlmProviderConfig,
    pub auto_promote_layers: bool,
}

/// Merge the settings layers, highest precedence first:
/// agent stage override, agent level, global stage override, global level,
/// daemon defaults.
pub fn resolve(
    agent_doc: Option<&SettingsDoc>,
    global_doc: Option<&SettingsDoc>,
    defaults: &DaemonDefaults,
) -> ResolvedPipelineSettings {
    let agent_level = agent_doc.and_then(|d| d.semantic_level).map(|l| l.expand());
    let global_level = global_doc.and_then(|d| d.semantic_level).map(|l| l.expand());
    let default_level = defaults.semantic_level.expand();

    let pick = |agent_override: Option<bool>,
                global_override: Option<bool>,
                from_level: fn(&StageToggles) -> bool| {
        agent_override
            .or(agent_level.as_ref().map(from_level))
            .or(global_override)
            .or(global_level.as_ref().map(from_level))
            .unwrap_or(from_level(&default_level))
    };

    let agent_stages = agent_doc.map(|d| d.stages).unwrap_or_default();
    let global_stages = global_doc.map(|d| d.stages).unwrap_or_default();

    let stages = StageToggles {
        extract: pick(agent_stages.extract, global_stages.extract, |t| t.extract),
        classify: pick(agent_stages.classify, global_stages.classify, |t| t.classify),
        entity_update: pick(agent_stages.entity_update, global_stages.entity_update, |t| {
            t.entity_update
        }),
        graph_link: pick(agent_stages.graph_link, global_stages.graph_link, |t| {
            t.graph_link
        }),
        layer_promote: pick(agent_stages.layer_promote, global_stages.layer_promote, |t| {
            t.layer_promote
        }),
    };

    let llm = agent_doc
        .and_then(|d| d.llm.clone())
        .or_else(|| global_doc.and_then(|d| d.llm.clone()))
        .unwrap_or_else(|| defaults.llm.clone());

    let auto_promote_layers = agent_doc
        .and_then(|d| d.auto_promote_layers)
        .or_else(|| global_doc.and_then(|d| d.auto_promote_layers))
        .unwrap_or(defaults.auto_promote_layers);

    ResolvedPipelineSettings {
        stages,
        llm,
        auto_promote_layers,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_expansion() {
        assert_eq!(SemanticLevel::Off.expand(), StageToggles::default());
        let basic = SemanticLevel::Basic.expand();
        assert!(basic.extract && !basic.classify);
        let enhanced = SemanticLevel::Enhanced.expand();
        assert!(enhanced.extract && enhanced.classify && enhanced.entity_update);
        assert!(!enhanced.graph_link && !enhanced.layer_promote);
        let full = SemanticLevel::Full.expand();
        assert!(
            full.extract
                && full.classify
                && full.entity_update
                && full.graph_link
                && full.layer_promote
        );
    }

    #[test]
    fn test_defaults_only() {
        let defaults = DaemonDefaults {
            semantic_level: SemanticLevel::Basic,
            ..Default::default()
        };
        let resolved = resolve(None, None, &defaults);
        assert!(resolved.stages.extract);
        assert!(!resolved.stages.classify);
    }

    #[test]
    fn test_agent_override_beats_everything() {
        let agent = SettingsDoc {
            agent_id: "agent1".to_string(),
            semantic_level: Some(SemanticLevel::Full),
            stages: StageOverrides {
                extract: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        let global = SettingsDoc {
            agent_id: GLOBAL_AGENT_ID.to_string(),
            stages: StageOverrides {
                extract: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let resolved = resolve(Some(&agent), Some(&global), &DaemonDefaults::default());
        // Stage override wins over the agent's own `full` level
        assert!(!resolved.stages.extract);
        // The rest of `full` still applies
        assert!(resolved.stages.graph_link);
    }

    #[test]
    fn test_agent_level_beats_global_override() {
        let agent = SettingsDoc {
            agent_id: "agent1".to_string(),
            semantic_level: Some(SemanticLevel::Off),
            ..Default::default()
        };
        let global = SettingsDoc {
            agent_id: GLOBAL_AGENT_ID.to_string(),
            stages: StageOverrides {
                classify: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let resolved = resolve(Some(&agent), Some(&global), &DaemonDefaults::default());
        assert!(!resolved.stages.classify);
    }

    #[test]
    fn test_global_layers_apply_without_agent_doc() {
        let global = SettingsDoc {
            agent_id: GLOBAL_AGENT_ID.to_string(),
            semantic_level: Some(SemanticLevel::Enhanced),
            stages: StageOverrides {
                graph_link: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let resolved = resolve(None, Some(&global), &DaemonDefaults::default());
        assert!(resolved.stages.extract);
        assert!(resolved.stages.classify);
        assert!(resolved.stages.graph_link);
        assert!(!resolved.stages.layer_promote);
    }

    #[test]
    fn test_llm_config_precedence() {
        let agent = SettingsDoc {
            agent_id: "agent1".to_string(),
            llm: Some(LlmProviderConfig {
                model: "agent-model".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let global = SettingsDoc {
            agent_id: GLOBAL_AGENT_ID.to_string(),
            llm: Some(LlmProviderConfig {
                model: "global-model".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let resolved = resolve(Some(&agent), Some(&global), &DaemonDefaults::default());
        assert_eq!(resolved.llm.model, "agent-model");
        let resolved = resolve(None, Some(&global), &DaemonDefaults::default());
        assert_eq!(resolved.llm.model, "global-model");
    }

    #[test]
    fn test_settings_doc_serde_roundtrip() {
        let doc = SettingsDoc {
            agent_id: "agent1".to_string(),
            semantic_level: Some(SemanticLevel::Enhanced),
            stages: StageOverrides {
                graph_link: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&doc).unwrap();
        let back: SettingsDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back.semantic_level, Some(SemanticLevel::Enhanced));
        assert_eq!(back.stages.graph_link, Some(false));
        assert_eq!(back.stages.extract, None);
    }
}

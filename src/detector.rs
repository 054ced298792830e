//! Pattern-based agent detection.
//!
//! Every detector shares one evaluation function and differs only in its
//! [`AgentSignature`]. Output is scanned in three tiers, strongest first:
//! 1. Direct regex signatures (0.9)
//! 2. Command prefixes, case-insensitive substring (0.8)
//! 3. Loose keywords, case-insensitive substring (0.6)
//!
//! The first tier that both matches and clears the threshold wins.

use crate::registry::{AgentPlugin, PluginMetadata};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const DIRECT_MATCH_CONFIDENCE: f64 = 0.9;
pub const COMMAND_PREFIX_CONFIDENCE: f64 = 0.8;
pub const KEYWORD_CONFIDENCE: f64 = 0.6;

static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| {
        Regex::new(r"\x1B\[[0-9;?<>=!]*[ -/]*[@-~]|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B[@-Z\\-_]")
            .unwrap()
    })
}

/// Strip ANSI escape sequences (CSI, OSC and two-byte escapes)
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").to_string()
}

/// Outcome of one detection pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detected: bool,
    pub agent_type: Option<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl DetectionResult {
    /// Negative result
    pub fn none() -> Self {
        Self {
            detected: false,
            agent_type: None,
            confidence: 0.0,
            metadata: None,
        }
    }

    fn hit(agent_type: &str, confidence: f64, tier: &str, matched: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("tier".to_string(), tier.to_string());
        metadata.insert("matched".to_string(), matched.to_string());
        Self {
            detected: true,
            agent_type: Some(agent_type.to_string()),
            confidence,
            metadata: Some(metadata),
        }
    }
}

/// Signature data for one agent
#[derive(Debug, Clone)]
pub struct AgentSignature {
    /// Reported as `agent_type` on a positive detection
    pub agent_type: String,
    pub patterns: Vec<Regex>,
    pub command_prefixes: Vec<String>,
    pub keywords: Vec<String>,
}

impl AgentSignature {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            patterns: Vec::new(),
            command_prefixes: Vec::new(),
            keywords: Vec::new(),
        }
    }

    /// Add direct signature patterns (regex syntax)
    pub fn with_patterns(mut self, patterns: &[&str]) -> Result<Self, regex::Error> {
        for pattern in patterns {
            self.patterns.push(Regex::new(pattern)?);
        }
        Ok(self)
    }

    pub fn with_command_prefixes(mut self, prefixes: &[&str]) -> Self {
        self.command_prefixes
            .extend(prefixes.iter().map(|p| p.to_lowercase()));
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords.extend(keywords.iter().map(|k| k.to_lowercase()));
        self
    }
}

/// Evaluate `chunk` against a signature. Stateless; nothing carries over between calls.
pub fn evaluate(signature: &AgentSignature, threshold: f64, chunk: &str) -> DetectionResult {
    let clean = strip_ansi(chunk);

    if DIRECT_MATCH_CONFIDENCE >= threshold {
        if let Some(pattern) = signature.patterns.iter().find(|p| p.is_match(&clean)) {
            return DetectionResult::hit(
                &signature.agent_type,
                DIRECT_MATCH_CONFIDENCE,
                "pattern",
                pattern.as_str(),
            );
        }
    }

    let lower = clean.to_lowercase();

    if COMMAND_PREFIX_CONFIDENCE >= threshold {
        if let Some(prefix) = signature
            .command_prefixes
            .iter()
            .find(|p| lower.contains(p.as_str()))
        {
            return DetectionResult::hit(
                &signature.agent_type,
                COMMAND_PREFIX_CONFIDENCE,
                "command",
                prefix,
            );
        }
    }

    if KEYWORD_CONFIDENCE >= threshold {
        if let Some(keyword) = signature.keywords.iter().find(|k| lower.contains(k.as_str())) {
            return DetectionResult::hit(
                &signature.agent_type,
                KEYWORD_CONFIDENCE,
                "keyword",
                keyword,
            );
        }
    }

    DetectionResult::none()
}

/// Stock detector plugin: metadata plus a signature
pub struct PatternDetector {
    metadata: PluginMetadata,
    signature: AgentSignature,
}

impl PatternDetector {
    pub fn new(metadata: PluginMetadata, signature: AgentSignature) -> Self {
        Self {
            metadata,
            signature,
        }
    }

    pub fn signature(&self) -> &AgentSignature {
        &self.signature
    }
}

#[async_trait]
impl AgentPlugin for PatternDetector {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn evaluate(&self, _terminal_id: &str, chunk: &str, threshold: f64) -> DetectionResult {
        evaluate(&self.signature, threshold, chunk)
    }
}

fn builtin(
    id: &str,
    name: &str,
    description: &str,
    signature: AgentSignature,
) -> PatternDetector {
    PatternDetector::new(
        PluginMetadata::new(id, name, env!("CARGO_PKG_VERSION"), description),
        signature,
    )
}

/// Detectors for the agent CLIs recognised out of the box
pub fn builtin_detectors() -> Result<Vec<PatternDetector>, regex::Error> {
    Ok(vec![
        builtin(
            "claude",
            "Claude Code",
            "Detects the Claude Code CLI",
            AgentSignature::new("claude")
                .with_patterns(&[r"(?i)claude\s+code", r"(?i)welcome\s+to\s+claude"])?
                .with_command_prefixes(&["claude ", "npx @anthropic-ai/claude-code"])
                .with_keywords(&["anthropic", "claude"]),
        ),
        builtin(
            "codex",
            "Codex",
            "Detects the OpenAI Codex CLI",
            AgentSignature::new("codex")
                .with_patterns(&[r"(?i)openai\s+codex", r"(?i)codex\s+cli"])?
                .with_command_prefixes(&["codex ", "npx @openai/codex"])
                .with_keywords(&["openai", "codex"]),
        ),
        builtin(
            "gemini",
            "Gemini CLI",
            "Detects the Google Gemini CLI",
            AgentSignature::new("gemini")
                .with_patterns(&[r"(?i)gemini\s+cli", r"(?i)google\s+gemini"])?
                .with_command_prefixes(&["gemini ", "npx @google/gemini-cli"])
                .with_keywords(&["gemini"]),
        ),
        builtin(
            "aider",
            "Aider",
            "Detects the aider pair-programming CLI",
            AgentSignature::new("aider")
                .with_patterns(&[r"(?i)\baider\s+v\d+(\.\d+)*"])?
                .with_command_prefixes(&["aider "])
                .with_keywords(&["aider"]),
        ),
    ])
}

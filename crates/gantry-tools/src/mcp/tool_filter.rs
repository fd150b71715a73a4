//! Per-backend tool allow filter.
//!
//! A backend's `allowed` list holds tool names or glob patterns (`*` allows
//! everything). A filter is consulted on every routed call and when the
//! gateway aggregates `tools/list`, so the agent never sees or reaches a tool
//! outside a backend's allow list.

use gantry_types::model::McpToolDef;

/// Allow filter compiled from a backend's `allowed` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFilter {
    /// `None` allows every tool.
    patterns: Option<Vec<String>>,
}

impl ToolFilter {
    /// A filter that allows every tool.
    pub fn allow_all() -> Self {
        Self { patterns: None }
    }

    /// Build from a backend's `allowed` entries.
    ///
    /// An absent list, or any `*` entry, allows everything.
    pub fn from_allowed(allowed: Option<&[String]>) -> Self {
        match allowed {
            None => Self::allow_all(),
            Some(entries) if entries.iter().any(|e| e == "*") => Self::allow_all(),
            Some(entries) => Self {
                patterns: Some(entries.to_vec()),
            },
        }
    }

    /// True when the filter is wildcard-all.
    pub fn is_wildcard(&self) -> bool {
        self.patterns.is_none()
    }

    /// Check whether a tool may be called.
    pub fn is_allowed(&self, tool_name: &str) -> bool {
        match &self.patterns {
            None => true,
            Some(patterns) => patterns
                .iter()
                .any(|pattern| pattern == tool_name || glob_match::glob_match(pattern, tool_name)),
        }
    }

    /// Filter a `tools/list` response down to the allowed tools.
    pub fn filter_tool_list(&self, tools: Vec<McpToolDef>) -> Vec<McpToolDef> {
        tools
            .into_iter()
            .filter(|tool| self.is_allowed(&tool.name))
            .collect()
    }
}

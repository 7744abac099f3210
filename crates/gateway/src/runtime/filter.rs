//! Tool visibility policy.
//!
//! Built once at startup from `[agent.tools]` and never reloaded for an
//! in-flight reply. Hidden tools are suppressed entirely (calls and
//! results); visible tools get their display name substituted on the way
//! out.

use std::collections::{HashMap, HashSet};

use studio_domain::config::AgentToolsConfig;

pub struct ToolDisplayFilter {
    hidden: HashSet<String>,
    rename: HashMap<String, String>,
}

impl ToolDisplayFilter {
    pub fn from_config(config: &AgentToolsConfig) -> Self {
        Self {
            hidden: config.hidden.iter().cloned().collect(),
            rename: config.rename.clone(),
        }
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden.contains(name)
    }

    /// The user-facing name: the configured rename, or the raw name.
    pub fn display<'a>(&'a self, name: &'a str) -> &'a str {
        self.rename.get(name).map(String::as_str).unwrap_or(name)
    }
}

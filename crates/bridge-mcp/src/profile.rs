//! Optional allow-list restricting which tools `tools/list`/`tools/call`
//! expose. Absent a profile every tool is available; operators pin a
//! profile to expose e.g. only `state_*` tools to a read-only integration.

use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ToolProfile {
    name: String,
    allowed: Option<HashSet<String>>,
}

impl Default for ToolProfile {
    fn default() -> Self {
        Self::unrestricted()
    }
}

impl ToolProfile {
    pub fn unrestricted() -> Self {
        Self { name: "full".to_string(), allowed: None }
    }

    pub fn allow_only(names: impl IntoIterator<Item = String>) -> Self {
        Self::named_allow_only("custom".to_string(), names)
    }

    pub fn named_allow_only(name: String, names: impl IntoIterator<Item = String>) -> Self {
        Self { name, allowed: Some(names.into_iter().collect()) }
    }

    /// Parse a comma-separated list, e.g. `VDO_BRIDGE_TOOL_PROFILE=state_set,state_get`.
    pub fn from_csv(value: &str) -> Self {
        let names: HashSet<String> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            Self::unrestricted()
        } else {
            Self::named_allow_only(value.to_string(), names)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_allowed(&self, tool_name: &str) -> bool {
        match &self.allowed {
            None => true,
            Some(set) => set.contains(tool_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_allows_everything() {
        assert!(ToolProfile::unrestricted().is_allowed("file_send"));
    }

    #[test]
    fn csv_profile_restricts() {
        let profile = ToolProfile::from_csv("state_set, state_get");
        assert!(profile.is_allowed("state_set"));
        assert!(!profile.is_allowed("file_send"));
    }
}

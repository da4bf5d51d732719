//! Allow/deny rules over (apiGroup, resource) pairs.

use serde::{Deserialize, Serialize};

/// One rule; `*` matches any group or resource. The core group is `""`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl FilterRule {
    pub fn new(api_groups: &[&str], resources: &[&str]) -> Self {
        Self {
            api_groups: api_groups.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn matches(&self, group: &str, resource: &str) -> bool {
        let hit = |patterns: &[String], value: &str| patterns.iter().any(|p| p == "*" || p == value);
        hit(&self.api_groups, group) && hit(&self.resources, resource)
    }
}

/// Deny wins; an empty allow list allows everything not denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceFilter {
    #[serde(default)]
    pub allow: Vec<FilterRule>,
    #[serde(default)]
    pub deny: Vec<FilterRule>,
}

/// Resources that churn constantly and carry no relationships worth graphing.
fn builtin_deny() -> [FilterRule; 2] {
    [
        FilterRule::new(&["", "events.k8s.io"], &["events"]),
        FilterRule::new(&["coordination.k8s.io"], &["leases"]),
    ]
}

impl ResourceFilter {
    pub fn allows(&self, group: &str, resource: &str) -> bool {
        if builtin_deny().iter().any(|r| r.matches(group, resource)) {
            return false;
        }
        if self.deny.iter().any(|r| r.matches(group, resource)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|r| r.matches(group, resource))
    }
}

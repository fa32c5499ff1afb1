//! Kubernetes resource validation results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a validated Kubernetes object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub risk: String,
    #[serde(default)]
    pub violation: Value,
}

/// Backend response for a single validated resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatedResourceResponse {
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub policy_violations: Vec<PolicyViolation>,
}

/// A validated resource tied back to the manifest file it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedResource {
    #[serde(flatten)]
    pub scope: Scope,
    pub file_path: String,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub policy_violations: Vec<PolicyViolation>,
}

/// Aggregate outcome of a validation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidatedResources {
    /// Per-document failures: parse errors and rejected validation calls.
    pub errors: Vec<ResourceError>,
    pub violated_resources: Vec<ValidatedResource>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceError {
    pub file_path: String,
    pub error: String,
}

/// Violated resources grouped by the policy that flagged them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidatedResourcesByPolicy {
    pub errors: Vec<ResourceError>,
    pub policies: BTreeMap<String, Vec<ValidatedResource>>,
}

impl ValidatedResources {
    /// Group by policy, dropping resources with no violations.
    pub fn to_by_policy(&self) -> ValidatedResourcesByPolicy {
        let mut policies: BTreeMap<String, Vec<ValidatedResource>> = BTreeMap::new();
        for resource in &self.violated_resources {
            if resource.policy_violations.is_empty() {
                continue;
            }
            policies
                .entry(resource.policy.clone())
                .or_default()
                .push(resource.clone());
        }
        ValidatedResourcesByPolicy {
            errors: self.errors.clone(),
            policies,
        }
    }
}

impl ValidatedResourcesByPolicy {
    pub fn policy_violations_count(&self) -> usize {
        self.policies
            .values()
            .flatten()
            .map(|r| r.policy_violations.len())
            .sum()
    }
}

//! IamRole Custom Resource Definition
//!
//! An IamRole declares an AWS IAM role bound to a ServiceAccount in the same
//! namespace, together with the inline and managed policies the role carries.

use std::collections::BTreeSet;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, InlinePolicy};
use crate::Error;

/// Maximum length of an IAM role name
const MAX_ROLE_NAME_LEN: usize = 64;

/// Maximum length of an IAM inline policy name
const MAX_POLICY_NAME_LEN: usize = 128;

/// Specification for an IamRole
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "iam.iclinic.com.br",
    version = "v1alpha1",
    kind = "IamRole",
    plural = "iamroles",
    shortname = "iamr",
    status = "IamRoleStatus",
    namespaced,
    printcolumn = r#"{"name":"ServiceAccount","type":"string","jsonPath":".spec.serviceAccount"}"#,
    printcolumn = r#"{"name":"ARN","type":"string","jsonPath":".status.arn"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IamRoleSpec {
    /// Name of the ServiceAccount (same namespace) that assumes this role
    pub service_account: String,

    /// Permission statements embedded on the role, keyed by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inline_policies: Vec<InlinePolicy>,

    /// ARNs of managed policies attached to the role
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies: Vec<String>,
}

impl IamRoleSpec {
    /// Validate the role specification
    ///
    /// Only checks what AWS would reject anyway or what makes the diff
    /// ambiguous (duplicate keys).
    pub fn validate(&self) -> Result<(), Error> {
        if self.service_account.trim().is_empty() {
            return Err(Error::validation("serviceAccount must not be empty"));
        }

        let mut names = BTreeSet::new();
        for policy in &self.inline_policies {
            if !is_iam_name(&policy.name, MAX_POLICY_NAME_LEN) {
                return Err(Error::validation(format!(
                    "inline policy name '{}' must be 1-{} characters of [A-Za-z0-9+=,.@_-]",
                    policy.name, MAX_POLICY_NAME_LEN
                )));
            }
            if !names.insert(policy.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate inline policy name '{}'",
                    policy.name
                )));
            }
            if policy.actions.is_empty() {
                return Err(Error::validation(format!(
                    "inline policy '{}' must list at least one action",
                    policy.name
                )));
            }
            if policy.resources.is_empty() {
                return Err(Error::validation(format!(
                    "inline policy '{}' must list at least one resource",
                    policy.name
                )));
            }
        }

        let mut arns = BTreeSet::new();
        for arn in &self.managed_policies {
            if !arn.starts_with("arn:") {
                return Err(Error::validation(format!(
                    "managed policy '{}' is not an ARN",
                    arn
                )));
            }
            if !arns.insert(arn.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate managed policy '{}'",
                    arn
                )));
            }
        }

        Ok(())
    }
}

impl IamRole {
    /// Name of the IAM role backing this resource
    pub fn role_name(&self) -> String {
        self.name_any()
    }

    /// Owner key recorded as a tag on the IAM role (`<namespace>/<name>`)
    pub fn owner_key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// The role ARN recorded in status, if any
    pub fn recorded_arn(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.arn.as_deref())
            .filter(|arn| !arn.is_empty())
    }

    /// Whether `metadata.name` is usable as an IAM role name
    ///
    /// Kubernetes allows names IAM never will, so no role can exist for a
    /// record that fails this.
    pub fn has_valid_role_name(&self) -> bool {
        is_iam_name(&self.name_any(), MAX_ROLE_NAME_LEN)
    }

    /// Validate metadata and spec
    pub fn validate(&self) -> Result<(), Error> {
        if !self.has_valid_role_name() {
            return Err(Error::validation(format!(
                "role name '{}' must be 1-{} characters of [A-Za-z0-9+=,.@_-]",
                self.name_any(),
                MAX_ROLE_NAME_LEN
            )));
        }
        self.spec.validate()
    }
}

/// Status for an IamRole
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamRoleStatus {
    /// ARN of the IAM role, set once when the role is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,

    /// Conditions representing the role state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl IamRoleStatus {
    /// Find a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

fn is_iam_name(name: &str, max_len: usize) -> bool {
    !name.is_empty()
        && name.len() <= max_len
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+=,.@_-".contains(c))
}

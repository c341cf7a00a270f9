//! IAM JSON policy documents
//!
//! Two documents are generated: the permission document pushed for each
//! inline policy, and the web-identity trust document a role is created with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{SubjectScope, TrustSettings};
use crate::crd::{InlinePolicy, PolicyEffect};
use crate::Error;

/// IAM policy language version
pub const POLICY_VERSION: &str = "2012-10-17";

/// Action a federated web identity uses to assume a role
const ASSUME_ROLE_WITH_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";

/// An IAM policy document
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    /// Policy language version
    pub version: String,
    /// Statements
    pub statement: Vec<Statement>,
}

/// A single policy statement
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    /// Statement id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Allow or Deny
    pub effect: PolicyEffect,
    /// Principal (trust documents only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    /// Actions
    pub action: Vec<String>,
    /// Resources (permission documents only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<String>,
    /// Condition operator -> key -> value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: BTreeMap<String, BTreeMap<String, String>>,
}

/// Principal of a trust statement
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Principal {
    /// Federated identity provider ARN
    pub federated: String,
}

impl PolicyDocument {
    /// Serialize to the compact JSON string IAM expects
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Permission document for one inline policy
pub fn inline_policy_document(policy: &InlinePolicy) -> PolicyDocument {
    PolicyDocument {
        version: POLICY_VERSION.to_string(),
        statement: vec![Statement {
            sid: None,
            effect: policy.effect,
            principal: None,
            action: policy.actions.clone(),
            resource: policy.resources.clone(),
            condition: BTreeMap::new(),
        }],
    }
}

/// The `sub` claim a projected ServiceAccount token carries
pub fn service_account_subject(namespace: &str, service_account: &str) -> String {
    format!("system:serviceaccount:{}:{}", namespace, service_account)
}

/// Trust document letting the ServiceAccount's web identity assume the role
///
/// In [`SubjectScope::ServiceAccount`] mode the subject is pinned with
/// `StringEquals` to exactly `namespace:service_account`. The unscoped mode
/// matches any ServiceAccount token from the issuer and must be opted into.
pub fn trust_policy_document(
    trust: &TrustSettings,
    namespace: &str,
    service_account: &str,
) -> PolicyDocument {
    let subject_key = format!("{}:sub", trust.oidc_issuer);
    let (operator, subject) = match trust.subject_scope {
        SubjectScope::ServiceAccount => (
            "StringEquals",
            service_account_subject(namespace, service_account),
        ),
        SubjectScope::Unscoped => ("StringLike", "system:serviceaccount:*".to_string()),
    };

    let condition = BTreeMap::from([(
        operator.to_string(),
        BTreeMap::from([(subject_key, subject)]),
    )]);

    PolicyDocument {
        version: POLICY_VERSION.to_string(),
        statement: vec![Statement {
            sid: Some(String::new()),
            effect: PolicyEffect::Allow,
            principal: Some(Principal {
                federated: format!(
                    "arn:aws:iam::{}:oidc-provider/{}",
                    trust.account_id, trust.oidc_issuer
                ),
            }),
            action: vec![ASSUME_ROLE_WITH_WEB_IDENTITY.to_string()],
            resource: Vec::new(),
            condition,
        }],
    }
}

/// Compare two JSON policy documents structurally
///
/// IAM hands documents back re-encoded, so byte equality is meaningless.
/// Unparseable input is treated as different, which forces a re-push.
pub fn documents_equal(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<serde_json::Value>(a),
        serde_json::from_str::<serde_json::Value>(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

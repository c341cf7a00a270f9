//! Kubernetes API access for the IamRole controller
//!
//! Finalizer and ARN writes carry the record's `resourceVersion`, so a write
//! against a stale copy fails with [`Error::Conflict`] instead of clobbering
//! a newer version.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;

use crate::crd::{Condition, IamRole};
use crate::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "iam-role-operator";

/// Trait abstracting the Kubernetes operations the controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch an IamRole, `None` if it no longer exists
    async fn get_iam_role(&self, namespace: &str, name: &str) -> Result<Option<IamRole>, Error>;

    /// Replace the finalizer list, returning the updated record
    async fn set_finalizers(&self, role: &IamRole, finalizers: Vec<String>)
        -> Result<IamRole, Error>;

    /// Record the role ARN in status, returning the updated record
    async fn set_role_arn(&self, role: &IamRole, arn: &str) -> Result<IamRole, Error>;

    /// Upsert one status condition and the observed generation
    async fn set_ready_condition(
        &self,
        role: &IamRole,
        condition: Condition,
        observed_generation: Option<i64>,
    ) -> Result<(), Error>;

    /// Fetch a ServiceAccount, `None` if it does not exist
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error>;

    /// Create a ServiceAccount carrying the given annotations
    async fn create_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Set a single annotation on a ServiceAccount, leaving the rest untouched
    async fn annotate_service_account(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn iam_roles(&self, namespace: &str) -> Api<IamRole> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn service_accounts(&self, namespace: &str) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Turn a 409 from the API server into [`Error::Conflict`]
fn write_error(what: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(format!("{}: {}", what, ae.message))
        }
        other => Error::Kube(other),
    }
}

/// Replace the condition of the same type, keeping its transition time when
/// the status did not flip
pub fn merge_condition(existing: &[Condition], mut condition: Condition) -> Vec<Condition> {
    let mut conditions: Vec<Condition> = Vec::with_capacity(existing.len() + 1);
    let mut replaced = false;
    for current in existing {
        if current.type_ == condition.type_ {
            if current.status == condition.status {
                condition.last_transition_time = current.last_transition_time;
            }
            conditions.push(condition.clone());
            replaced = true;
        } else {
            conditions.push(current.clone());
        }
    }
    if !replaced {
        conditions.push(condition);
    }
    conditions
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_iam_role(&self, namespace: &str, name: &str) -> Result<Option<IamRole>, Error> {
        Ok(self.iam_roles(namespace).get_opt(name).await?)
    }

    async fn set_finalizers(
        &self,
        role: &IamRole,
        finalizers: Vec<String>,
    ) -> Result<IamRole, Error> {
        let namespace = role.namespace().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": role.resource_version(),
                "finalizers": finalizers
            }
        });

        self.iam_roles(&namespace)
            .patch(
                &role.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| write_error("finalizer update", e))
    }

    async fn set_role_arn(&self, role: &IamRole, arn: &str) -> Result<IamRole, Error> {
        let namespace = role.namespace().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": role.resource_version()
            },
            "status": {
                "arn": arn
            }
        });

        self.iam_roles(&namespace)
            .patch_status(
                &role.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| write_error("status arn update", e))
    }

    async fn set_ready_condition(
        &self,
        role: &IamRole,
        condition: Condition,
        observed_generation: Option<i64>,
    ) -> Result<(), Error> {
        let namespace = role.namespace().unwrap_or_default();
        let existing = role
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();

        let mut status = serde_json::json!({
            "conditions": merge_condition(existing, condition)
        });
        if let Some(generation) = observed_generation {
            status["observedGeneration"] = serde_json::json!(generation);
        }

        self.iam_roles(&namespace)
            .patch_status(
                &role.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        Ok(self.service_accounts(namespace).get_opt(name).await?)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let service_account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };

        self.service_accounts(namespace)
            .create(
                &PostParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &service_account,
            )
            .await
            .map_err(|e| write_error("serviceaccount create", e))?;
        Ok(())
    }

    async fn annotate_service_account(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { key: value }
            }
        });

        self.service_accounts(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

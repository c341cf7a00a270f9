//! ServiceAccount binding
//!
//! The ServiceAccount named by the IamRole carries the role ARN in the
//! `eks.amazonaws.com/role-arn` annotation. Only that annotation is written.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::info;

use super::iam_role::Context;
use crate::crd::IamRole;
use crate::{Error, ROLE_ARN_ANNOTATION};

/// What [`ensure_binding`] changed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingChange {
    /// The ServiceAccount was created
    Created,
    /// The annotation was set or corrected
    Updated,
    /// Already bound
    Unchanged,
}

/// Make sure the ServiceAccount exists and points at `arn`
pub async fn ensure_binding(
    role: &IamRole,
    arn: &str,
    ctx: &Context,
) -> Result<BindingChange, Error> {
    let namespace = role.namespace().unwrap_or_default();
    let service_account = &role.spec.service_account;

    let Some(existing) = ctx
        .kube
        .get_service_account(&namespace, service_account)
        .await?
    else {
        ctx.kube
            .create_service_account(
                &namespace,
                service_account,
                BTreeMap::from([(ROLE_ARN_ANNOTATION.to_string(), arn.to_string())]),
            )
            .await?;
        info!(service_account = %service_account, "created ServiceAccount");
        return Ok(BindingChange::Created);
    };

    let current = existing.annotations().get(ROLE_ARN_ANNOTATION);
    if current.map(String::as_str) == Some(arn) {
        return Ok(BindingChange::Unchanged);
    }

    ctx.kube
        .annotate_service_account(&namespace, service_account, ROLE_ARN_ANNOTATION, arn)
        .await?;
    info!(
        service_account = %service_account,
        previous = ?current,
        "annotated ServiceAccount with role ARN"
    );
    Ok(BindingChange::Updated)
}

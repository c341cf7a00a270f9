//! IAM role convergence
//!
//! Creates the backing role on first observation and records its ARN. An
//! existing role is never modified here, only checked for ownership.

use kube::ResourceExt;
use tracing::{debug, info};

use super::iam_role::Context;
use crate::crd::IamRole;
use crate::iam::document::trust_policy_document;
use crate::iam::{owner_tags, CreateRoleRequest, RemoteRole};
use crate::Error;

/// Result of [`ensure_role`]
#[derive(Clone, Debug)]
pub struct EnsuredRole {
    /// The IamRole record, refreshed if status was written
    pub record: IamRole,
    /// Live role ARN
    pub arn: String,
    /// The role was created during this pass
    pub created: bool,
}

/// Whether a live role belongs to this IamRole
///
/// A role carrying our owner tag is ours. An untagged role is ours only if
/// its ARN is the one already recorded in status.
pub(crate) fn is_owned(role: &IamRole, remote: &RemoteRole) -> bool {
    match remote.owner() {
        Some(owner) => owner == role.owner_key(),
        None => role.recorded_arn() == Some(remote.arn.as_str()),
    }
}

/// Make sure the IAM role exists and its ARN is recorded
pub async fn ensure_role(role: IamRole, ctx: &Context) -> Result<EnsuredRole, Error> {
    let name = role.role_name();

    let Some(remote) = ctx.iam.get_role(&name).await? else {
        return create_role(role, ctx).await;
    };

    if !is_owned(&role, &remote) {
        let message = match remote.owner() {
            Some(owner) => format!("role is owned by IamRole {}", owner),
            None => "role exists and was not created for this IamRole".to_string(),
        };
        return Err(Error::ownership(name, message));
    }

    if role.recorded_arn() == Some(remote.arn.as_str()) {
        debug!(arn = %remote.arn, "IAM role present");
        return Ok(EnsuredRole {
            record: role,
            arn: remote.arn,
            created: false,
        });
    }

    info!(
        arn = %remote.arn,
        recorded = ?role.recorded_arn(),
        "recording ARN of existing IAM role"
    );
    let record = ctx.kube.set_role_arn(&role, &remote.arn).await?;
    Ok(EnsuredRole {
        record,
        arn: remote.arn,
        created: false,
    })
}

async fn create_role(role: IamRole, ctx: &Context) -> Result<EnsuredRole, Error> {
    let name = role.role_name();
    let namespace = role.namespace().unwrap_or_default();

    let trust_document =
        trust_policy_document(&ctx.settings.trust, &namespace, &role.spec.service_account)
            .to_json()?;

    let arn = ctx
        .iam
        .create_role(CreateRoleRequest {
            name: name.clone(),
            trust_document,
            tags: owner_tags(&role.owner_key()),
        })
        .await?;
    info!(arn = %arn, service_account = %role.spec.service_account, "created IAM role");

    let record = ctx.kube.set_role_arn(&role, &arn).await?;
    Ok(EnsuredRole {
        record,
        arn,
        created: true,
    })
}

//! Finalizer-gated deletion
//!
//! The finalizer is on the IamRole whenever an IAM role may exist for it.
//! It is added before the first IAM call and stripped only after the role
//! is confirmed gone (or was never ours).

use kube::ResourceExt;
use tracing::{info, warn};

use super::iam_role::Context;
use super::role::is_owned;
use crate::crd::IamRole;
use crate::Error;

/// Finalizer guarding IAM role cleanup
pub const FINALIZER: &str = "iam.iclinic.com.br/finalizer";

/// Deletion lifecycle of an IamRole record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Active, finalizer not yet added
    NoMarker,
    /// Active, finalizer present
    Marked,
    /// Deletion requested, teardown pending
    Deleting,
    /// Deletion requested, nothing left to clean up
    Cleaned,
}

impl Lifecycle {
    /// Derive the lifecycle state from the record's metadata
    pub fn of(role: &IamRole) -> Self {
        match (role.metadata.deletion_timestamp.is_some(), has_finalizer(role)) {
            (false, false) => Self::NoMarker,
            (false, true) => Self::Marked,
            (true, true) => Self::Deleting,
            (true, false) => Self::Cleaned,
        }
    }
}

/// Check if the IamRole carries our finalizer
pub fn has_finalizer(role: &IamRole) -> bool {
    role.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add our finalizer, returning the updated record
pub async fn add_finalizer(role: &IamRole, ctx: &Context) -> Result<IamRole, Error> {
    let mut finalizers = role.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    info!("adding finalizer");
    ctx.kube.set_finalizers(role, finalizers).await
}

/// Strip our finalizer, leaving any others in place
pub async fn remove_finalizer(role: &IamRole, ctx: &Context) -> Result<IamRole, Error> {
    let finalizers = role
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    info!("removing finalizer");
    ctx.kube.set_finalizers(role, finalizers).await
}

/// What [`teardown`] found on the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    /// The role and its policies were deleted
    Deleted,
    /// No role by that name
    AlreadyAbsent,
    /// A role by that name exists but is not ours; left in place
    Foreign,
}

/// Remove everything the IamRole created on the backend
///
/// Policy cleanup is best-effort. A failed role deletion is returned so the
/// finalizer stays until the next attempt succeeds.
pub async fn teardown(role: &IamRole, ctx: &Context) -> Result<Teardown, Error> {
    if !role.has_valid_role_name() {
        info!("name is not a valid IAM role name, nothing to tear down");
        return Ok(Teardown::AlreadyAbsent);
    }
    let name = role.role_name();

    match ctx.iam.get_role(&name).await? {
        None => {
            info!("IAM role already absent");
            return Ok(Teardown::AlreadyAbsent);
        }
        Some(remote) if !is_owned(role, &remote) => {
            warn!(
                arn = %remote.arn,
                owner = ?remote.owner(),
                "IAM role is not owned by this IamRole, leaving it in place"
            );
            return Ok(Teardown::Foreign);
        }
        Some(_) => {}
    }

    match ctx.iam.list_inline_policies(&name).await {
        Ok(policies) => {
            for policy in policies {
                if let Err(e) = ctx.iam.delete_inline_policy(&name, &policy).await {
                    warn!(policy = %policy, error = %e, "failed to delete inline policy");
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to list inline policies"),
    }

    match ctx.iam.list_managed_policies(&name).await {
        Ok(arns) => {
            for arn in arns {
                if let Err(e) = ctx.iam.detach_managed_policy(&name, &arn).await {
                    warn!(policy_arn = %arn, error = %e, "failed to detach managed policy");
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to list managed policies"),
    }

    ctx.iam.delete_role(&name).await?;
    info!(namespace = ?role.namespace(), "deleted IAM role");
    Ok(Teardown::Deleted)
}

//! Set synchronization of role policy attachments
//!
//! Inline policies and managed policy attachments are both named sets hung
//! off a role. A pass is split into a read-only [`plan_attachments`] and two
//! apply phases, so a caller holding several sets can land every addition
//! before any removal. A pass that fails midway leaves the role with at
//! least the desired permissions.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use crate::crd::InlinePolicy;
use crate::iam::document::{documents_equal, inline_policy_document};
use crate::iam::IamGateway;
use crate::Error;

/// A named collection of attachments on one IAM role
#[async_trait]
pub trait AttachmentSet: Send + Sync {
    /// Desired element type
    type Item: Sync;

    /// Human-readable kind for logs
    fn kind(&self) -> &'static str;

    /// Identity of an element within the set
    fn key<'a>(&self, item: &'a Self::Item) -> &'a str;

    /// Keys currently attached on the backend
    async fn list(&self) -> Result<BTreeSet<String>, Error>;

    /// Whether an element present on both sides must be re-pushed
    ///
    /// Runs during planning, so implementations may only issue read calls.
    /// One read per element on both sides is spent on every pass.
    async fn needs_push(&self, item: &Self::Item) -> Result<bool, Error>;

    /// Attach (or upsert) an element
    async fn add(&self, item: &Self::Item) -> Result<(), Error>;

    /// Detach an element by key
    async fn remove(&self, key: &str) -> Result<(), Error>;
}

/// Keys touched by one synchronization pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Newly attached
    pub added: Vec<String>,
    /// Present on both sides but re-pushed with new content
    pub updated: Vec<String>,
    /// Detached
    pub removed: Vec<String>,
}

impl SyncReport {
    /// True if the pass made no backend change
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Changes needed to bring one set to its desired state
pub struct SyncPlan<'a, T> {
    pushes: Vec<&'a T>,
    report: SyncReport,
}

impl<T> SyncPlan<'_, T> {
    /// Keys the plan adds, updates and removes
    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    /// Consume the plan once applied
    pub fn into_report(self) -> SyncReport {
        self.report
    }
}

/// Diff `desired` against the live set without changing anything
pub async fn plan_attachments<'a, S: AttachmentSet>(
    set: &S,
    desired: &'a [S::Item],
) -> Result<SyncPlan<'a, S::Item>, Error> {
    let actual = set.list().await?;
    let desired_keys: BTreeSet<&str> = desired.iter().map(|item| set.key(item)).collect();
    let mut plan = SyncPlan {
        pushes: Vec::new(),
        report: SyncReport::default(),
    };

    for item in desired {
        let key = set.key(item);
        if !actual.contains(key) {
            plan.pushes.push(item);
            plan.report.added.push(key.to_string());
        } else if set.needs_push(item).await? {
            plan.pushes.push(item);
            plan.report.updated.push(key.to_string());
        }
    }

    plan.report.removed = actual
        .into_iter()
        .filter(|k| !desired_keys.contains(k.as_str()))
        .collect();
    Ok(plan)
}

/// Push every planned addition and update
pub async fn apply_additions<S: AttachmentSet>(
    set: &S,
    plan: &SyncPlan<'_, S::Item>,
) -> Result<(), Error> {
    for item in &plan.pushes {
        set.add(item).await?;
    }
    Ok(())
}

/// Detach every planned removal
pub async fn apply_removals<S: AttachmentSet>(
    set: &S,
    plan: &SyncPlan<'_, S::Item>,
) -> Result<(), Error> {
    for key in &plan.report.removed {
        set.remove(key).await?;
    }
    if !plan.report.is_empty() {
        debug!(kind = set.kind(), report = ?plan.report, "synchronized attachments");
    }
    Ok(())
}

/// Converge a single live set to `desired`
///
/// Any failed call aborts the pass; the next reconcile recomputes the diff.
pub async fn sync_attachments<S: AttachmentSet>(
    set: &S,
    desired: &[S::Item],
) -> Result<SyncReport, Error> {
    let plan = plan_attachments(set, desired).await?;
    apply_additions(set, &plan).await?;
    apply_removals(set, &plan).await?;
    Ok(plan.into_report())
}

/// Inline policies embedded on a role
pub struct InlinePolicies<'a> {
    iam: &'a dyn IamGateway,
    role: &'a str,
}

impl<'a> InlinePolicies<'a> {
    /// Inline policy set of `role`
    pub fn new(iam: &'a dyn IamGateway, role: &'a str) -> Self {
        Self { iam, role }
    }
}

#[async_trait]
impl<'s> AttachmentSet for InlinePolicies<'s> {
    type Item = InlinePolicy;

    fn kind(&self) -> &'static str {
        "inline policy"
    }

    fn key<'a>(&self, item: &'a InlinePolicy) -> &'a str {
        &item.name
    }

    async fn list(&self) -> Result<BTreeSet<String>, Error> {
        self.iam.list_inline_policies(self.role).await
    }

    async fn needs_push(&self, item: &InlinePolicy) -> Result<bool, Error> {
        let desired = inline_policy_document(item).to_json()?;
        let live = self.iam.get_inline_policy(self.role, &item.name).await?;
        Ok(live.map_or(true, |live| !documents_equal(&live, &desired)))
    }

    async fn add(&self, item: &InlinePolicy) -> Result<(), Error> {
        let document = inline_policy_document(item).to_json()?;
        self.iam
            .put_inline_policy(self.role, &item.name, &document)
            .await
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.iam.delete_inline_policy(self.role, key).await
    }
}

/// Managed policies attached to a role
pub struct ManagedPolicies<'a> {
    iam: &'a dyn IamGateway,
    role: &'a str,
}

impl<'a> ManagedPolicies<'a> {
    /// Managed policy set of `role`
    pub fn new(iam: &'a dyn IamGateway, role: &'a str) -> Self {
        Self { iam, role }
    }
}

#[async_trait]
impl<'s> AttachmentSet for ManagedPolicies<'s> {
    type Item = String;

    fn kind(&self) -> &'static str {
        "managed policy"
    }

    fn key<'a>(&self, item: &'a String) -> &'a str {
        item
    }

    async fn list(&self) -> Result<BTreeSet<String>, Error> {
        self.iam.list_managed_policies(self.role).await
    }

    // An attachment has no content
    async fn needs_push(&self, _item: &String) -> Result<bool, Error> {
        Ok(false)
    }

    async fn add(&self, item: &String) -> Result<(), Error> {
        self.iam.attach_managed_policy(self.role, item).await
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.iam.detach_managed_policy(self.role, key).await
    }
}

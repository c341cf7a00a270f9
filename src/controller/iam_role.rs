//! IamRole controller implementation
//!
//! Each pass re-reads the IamRole and the live IAM state, then walks the
//! same sequence: finalizer, validation, role, inline policies, managed
//! policies, ServiceAccount binding, Ready condition. The first failing step
//! ends the pass and its error decides the requeue in [`error_policy`].

use std::sync::Arc;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::binding::{ensure_binding, BindingChange};
use super::finalizer::{add_finalizer, remove_finalizer, teardown, Lifecycle, Teardown};
use super::kube_client::{KubeClient, KubeClientImpl};
use super::policy_sync::{
    apply_additions, apply_removals, plan_attachments, InlinePolicies, ManagedPolicies,
};
use super::role::ensure_role;
use crate::config::ReconcilerSettings;
use crate::crd::{Condition, ConditionStatus, IamRole};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::iam::IamGateway;
use crate::Error;

/// Name reported on Events and used as the field manager
pub const CONTROLLER_NAME: &str = "iam-role-operator";

/// Condition type summarizing convergence
pub const READY_CONDITION: &str = "Ready";

/// Controller context shared by all reconciles
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// IAM backend gateway
    pub iam: Arc<dyn IamGateway>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Trust and requeue settings
    pub settings: ReconcilerSettings,
    /// Consecutive transient failures per `<namespace>/<name>`
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        iam: Arc<dyn IamGateway>,
        settings: ReconcilerSettings,
    ) -> ContextBuilder {
        ContextBuilder::new(client, iam, settings)
    }

    /// Create a context for testing with substitute clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        iam: Arc<dyn IamGateway>,
        events: Arc<dyn EventPublisher>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            kube,
            iam,
            events,
            settings,
            failures: DashMap::new(),
        }
    }

    /// Count one more consecutive failure for `key`
    fn record_failure(&self, key: &str) -> u32 {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        let count = entry.value_mut();
        *count = count.saturating_add(1);
        *count
    }

    fn reset_failures(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    iam: Arc<dyn IamGateway>,
    settings: ReconcilerSettings,
}

impl ContextBuilder {
    fn new(client: Client, iam: Arc<dyn IamGateway>, settings: ReconcilerSettings) -> Self {
        Self {
            client,
            iam,
            settings,
        }
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(KubeClientImpl::new(self.client.clone())),
            events: Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)),
            iam: self.iam,
            settings: self.settings,
            failures: DashMap::new(),
        }
    }
}

/// Reconcile an IamRole resource
///
/// # Returns
///
/// `Action::requeue(resync)` once converged, `Action::await_change()` when
/// the record is gone or fully cleaned up, or the error of the failing step.
#[instrument(skip(role, ctx), fields(iam_role = %role.owner_key()))]
pub async fn reconcile(role: Arc<IamRole>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = role.namespace().unwrap_or_default();
    let key = role.owner_key();

    // The watch event may be stale; act on the stored version
    let Some(current) = ctx.kube.get_iam_role(&namespace, &role.name_any()).await? else {
        debug!("IamRole no longer exists");
        ctx.reset_failures(&key);
        return Ok(Action::await_change());
    };

    match converge(current.clone(), &ctx).await {
        Ok(action) => {
            ctx.reset_failures(&key);
            Ok(action)
        }
        Err(e) => {
            report_failure(&current, &e, &ctx).await;
            Err(e)
        }
    }
}

async fn converge(mut role: IamRole, ctx: &Context) -> Result<Action, Error> {
    match Lifecycle::of(&role) {
        Lifecycle::Cleaned => {
            debug!("IamRole deleted and already cleaned up");
            return Ok(Action::await_change());
        }
        Lifecycle::Deleting => {
            info!("IamRole deleted, tearing down IAM role");
            let outcome = teardown(&role, ctx).await?;
            if outcome == Teardown::Deleted {
                publish(
                    ctx,
                    &role,
                    EventType::Normal,
                    reasons::ROLE_DELETED,
                    actions::DELETE,
                    format!("Deleted IAM role {}", role.role_name()),
                )
                .await;
            }
            remove_finalizer(&role, ctx).await?;
            return Ok(Action::await_change());
        }
        Lifecycle::NoMarker => {
            // No IAM role can exist for an invalid record
            role.validate()?;
            role = add_finalizer(&role, ctx).await?;
        }
        Lifecycle::Marked => role.validate()?,
    }

    let ensured = ensure_role(role, ctx).await?;
    let role = ensured.record;
    let arn = ensured.arn;
    let role_name = role.role_name();
    if ensured.created {
        publish(
            ctx,
            &role,
            EventType::Normal,
            reasons::ROLE_CREATED,
            actions::RECONCILE,
            format!("Created IAM role {}", arn),
        )
        .await;
    }

    // Grants land in both collections before either loses anything
    let inline_set = InlinePolicies::new(ctx.iam.as_ref(), &role_name);
    let managed_set = ManagedPolicies::new(ctx.iam.as_ref(), &role_name);
    let inline = plan_attachments(&inline_set, &role.spec.inline_policies).await?;
    let managed = plan_attachments(&managed_set, &role.spec.managed_policies).await?;
    apply_additions(&inline_set, &inline).await?;
    apply_additions(&managed_set, &managed).await?;
    apply_removals(&inline_set, &inline).await?;
    apply_removals(&managed_set, &managed).await?;
    let (inline, managed) = (inline.into_report(), managed.into_report());
    if !inline.is_empty() || !managed.is_empty() {
        info!(?inline, ?managed, "policies synchronized");
        publish(
            ctx,
            &role,
            EventType::Normal,
            reasons::POLICIES_SYNCED,
            actions::RECONCILE,
            format!(
                "inline +{} ~{} -{}, managed +{} -{}",
                inline.added.len(),
                inline.updated.len(),
                inline.removed.len(),
                managed.added.len(),
                managed.removed.len()
            ),
        )
        .await;
    }

    let binding = ensure_binding(&role, &arn, ctx).await?;
    if binding != BindingChange::Unchanged {
        publish(
            ctx,
            &role,
            EventType::Normal,
            reasons::SERVICE_ACCOUNT_BOUND,
            actions::RECONCILE,
            format!("ServiceAccount {} bound to {}", role.spec.service_account, arn),
        )
        .await;
    }

    let ready = Condition::new(
        READY_CONDITION,
        ConditionStatus::True,
        "Converged",
        format!(
            "IAM role {} bound to ServiceAccount {}",
            arn, role.spec.service_account
        ),
    );
    update_ready_condition(&role, ready, ctx).await;

    debug!(arn = %arn, "IamRole converged");
    Ok(Action::requeue(ctx.settings.resync_interval))
}

/// Write the Ready condition if it differs from what status already says
async fn update_ready_condition(role: &IamRole, condition: Condition, ctx: &Context) {
    let status = role.status.as_ref();
    let unchanged = status
        .and_then(|s| s.condition(READY_CONDITION))
        .is_some_and(|c| c.same_state(&condition))
        && status.and_then(|s| s.observed_generation) == role.metadata.generation;
    if unchanged {
        return;
    }

    if let Err(e) = ctx
        .kube
        .set_ready_condition(role, condition, role.metadata.generation)
        .await
    {
        warn!(error = %e, "failed to update Ready condition");
    }
}

async fn report_failure(role: &IamRole, error: &Error, ctx: &Context) {
    let condition = Condition::new(
        READY_CONDITION,
        ConditionStatus::False,
        error.reason(),
        error.to_string(),
    );
    update_ready_condition(role, condition, ctx).await;

    publish(
        ctx,
        role,
        EventType::Warning,
        reasons::RECONCILE_FAILED,
        actions::RECONCILE,
        error.to_string(),
    )
    .await;
}

async fn publish(
    ctx: &Context,
    role: &IamRole,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&role.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Error policy for the controller
///
/// Transient errors back off exponentially per object; permanent errors
/// wait the fixed permanent-error interval.
pub fn error_policy(role: Arc<IamRole>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = role.owner_key();

    if error.is_retryable() {
        let failures = ctx.record_failure(&key);
        let delay = ctx.settings.backoff.delay_for(failures);
        warn!(
            iam_role = %key,
            error = %error,
            failures,
            delay_ms = delay.as_millis() as u64,
            "reconciliation failed, backing off"
        );
        Action::requeue(delay)
    } else {
        error!(
            iam_role = %key,
            error = %error,
            reason = error.reason(),
            "reconciliation failed permanently"
        );
        Action::requeue(ctx.settings.permanent_error_requeue)
    }
}

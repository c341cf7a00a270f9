//! In-memory IAM backend and Kubernetes store for unit tests
//!
//! Both fakes log every call so tests can assert on call order, and both
//! accept failure injection by operation name.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ErrorResponse, ObjectMeta};
use kube::ResourceExt;

use crate::config::{ReconcilerSettings, SubjectScope, TrustSettings};
use crate::controller::kube_client::{merge_condition, KubeClient};
use crate::controller::Context;
use crate::crd::{Condition, IamRole, IamRoleSpec, IamRoleStatus, InlinePolicy, PolicyEffect};
use crate::error::IamErrorKind;
use crate::events::{EventPublisher, NoopEventPublisher};
use crate::iam::document::inline_policy_document;
use crate::iam::{CreateRoleRequest, IamGateway, RemoteRole};
use crate::Error;

/// Account id used by test trust settings
pub const TEST_ACCOUNT: &str = "123456789012";

/// Issuer used by test trust settings
pub const TEST_ISSUER: &str = "oidc.eks.us-east-1.amazonaws.com/id/TEST";

/// An IamRole with no policies
pub fn sample_role(namespace: &str, name: &str, service_account: &str) -> IamRole {
    let mut role = IamRole::new(
        name,
        IamRoleSpec {
            service_account: service_account.to_string(),
            inline_policies: Vec::new(),
            managed_policies: Vec::new(),
        },
    );
    role.metadata.namespace = Some(namespace.to_string());
    role
}

/// An Allow policy on `s3:GetObject`
pub fn inline_policy(name: &str) -> InlinePolicy {
    InlinePolicy {
        name: name.to_string(),
        effect: PolicyEffect::Allow,
        actions: vec!["s3:GetObject".to_string()],
        resources: vec!["arn:aws:s3:::bucket/*".to_string()],
    }
}

/// Default reconciler settings with scoped trust
pub fn test_settings() -> ReconcilerSettings {
    ReconcilerSettings::new(TrustSettings {
        account_id: TEST_ACCOUNT.to_string(),
        oidc_issuer: TEST_ISSUER.to_string(),
        subject_scope: SubjectScope::ServiceAccount,
    })
}

/// Context over the two fakes
pub fn test_context(iam: Arc<FakeIam>, kube: Arc<FakeKube>) -> Context {
    test_context_with(iam, kube)
}

/// Context over arbitrary clients, dropping events
pub fn test_context_with(iam: Arc<dyn IamGateway>, kube: Arc<dyn KubeClient>) -> Context {
    Context::for_testing(kube, iam, Arc::new(NoopEventPublisher), test_settings())
}

/// Context over the fakes with a custom event publisher
pub fn test_context_with_events(
    iam: Arc<FakeIam>,
    kube: Arc<FakeKube>,
    events: Arc<dyn EventPublisher>,
) -> Context {
    Context::for_testing(kube, iam, events, test_settings())
}

// =============================================================================
// IAM
// =============================================================================

#[derive(Default)]
struct FakeRole {
    arn: String,
    trust_document: String,
    tags: BTreeMap<String, String>,
    inline: BTreeMap<String, String>,
    managed: BTreeSet<String>,
}

#[derive(Default)]
struct IamState {
    roles: BTreeMap<String, FakeRole>,
    calls: Vec<String>,
    failures: BTreeMap<&'static str, IamErrorKind>,
}

impl IamState {
    fn call(&mut self, operation: &'static str, args: &[&str]) -> Result<(), Error> {
        let mut entry = operation.to_string();
        for arg in args {
            entry.push(' ');
            entry.push_str(arg);
        }
        self.calls.push(entry);
        match self.failures.get(operation) {
            Some(kind) => Err(Error::iam(operation, *kind, "injected failure")),
            None => Ok(()),
        }
    }

    fn role_mut(&mut self, operation: &'static str, name: &str) -> Result<&mut FakeRole, Error> {
        self.roles.get_mut(name).ok_or_else(|| {
            Error::iam(
                operation,
                IamErrorKind::NotFound,
                format!("role {} not found", name),
            )
        })
    }
}

/// In-memory IAM backend
#[derive(Default)]
pub struct FakeIam {
    state: Mutex<IamState>,
}

impl FakeIam {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }

    fn arn(name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", TEST_ACCOUNT, name)
    }

    /// Seed a role without logging a call
    pub fn insert_role(&self, name: &str, tags: BTreeMap<String, String>) {
        self.state.lock().unwrap().roles.insert(
            name.to_string(),
            FakeRole {
                arn: Self::arn(name),
                tags,
                ..Default::default()
            },
        );
    }

    /// Seed an inline policy without logging a call
    pub fn put(&self, role: &str, policy: &InlinePolicy) {
        let document = inline_policy_document(policy).to_json().unwrap();
        let mut state = self.state.lock().unwrap();
        let role = state.roles.get_mut(role).unwrap();
        role.inline.insert(policy.name.clone(), document);
    }

    /// Seed a managed attachment without logging a call
    pub fn attach(&self, role: &str, arn: &str) {
        let mut state = self.state.lock().unwrap();
        state.roles.get_mut(role).unwrap().managed.insert(arn.to_string());
    }

    /// Fail every call to `operation` until cleared
    pub fn fail_on(&self, operation: &'static str, kind: IamErrorKind) {
        self.state.lock().unwrap().failures.insert(operation, kind);
    }

    /// Drop all injected failures
    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Every call in order, e.g. `PutRolePolicy r1 p1`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls other than Get*/List*
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("Get") && !c.starts_with("List"))
            .collect()
    }

    /// Forget the call log
    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Whether a role exists
    pub fn has_role(&self, name: &str) -> bool {
        self.state.lock().unwrap().roles.contains_key(name)
    }

    /// Inline policy names on a role
    pub fn inline(&self, role: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(role)
            .map(|r| r.inline.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored document of an inline policy
    pub fn inline_document(&self, role: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(role)
            .and_then(|r| r.inline.get(name).cloned())
    }

    /// Managed policy ARNs on a role
    pub fn managed(&self, role: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(role)
            .map(|r| r.managed.clone())
            .unwrap_or_default()
    }

    /// Trust document a role was created with
    pub fn trust_document(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(name)
            .map(|r| r.trust_document.clone())
    }

    /// Tags of a role
    pub fn tags(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(name)
            .map(|r| r.tags.clone())
    }
}

#[async_trait]
impl IamGateway for FakeIam {
    async fn get_role(&self, name: &str) -> Result<Option<RemoteRole>, Error> {
        let mut state = self.state.lock().unwrap();
        state.call("GetRole", &[name])?;
        Ok(state.roles.get(name).map(|r| RemoteRole {
            arn: r.arn.clone(),
            tags: r.tags.clone(),
        }))
    }

    async fn create_role(&self, request: CreateRoleRequest) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state.call("CreateRole", &[request.name.as_str()])?;
        if state.roles.contains_key(&request.name) {
            return Err(Error::iam(
                "CreateRole",
                IamErrorKind::AlreadyExists,
                format!("role {} already exists", request.name),
            ));
        }
        let arn = Self::arn(&request.name);
        state.roles.insert(
            request.name,
            FakeRole {
                arn: arn.clone(),
                trust_document: request.trust_document,
                tags: request.tags,
                ..Default::default()
            },
        );
        Ok(arn)
    }

    async fn delete_role(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.call("DeleteRole", &[name])?;
        let Some(role) = state.roles.get(name) else {
            return Ok(());
        };
        if !role.inline.is_empty() || !role.managed.is_empty() {
            return Err(Error::iam(
                "DeleteRole",
                IamErrorKind::Other,
                "DeleteConflict: role still has policies",
            ));
        }
        state.roles.remove(name);
        Ok(())
    }

    async fn list_inline_policies(&self, role: &str) -> Result<BTreeSet<String>, Error> {
        let mut state = self.state.lock().unwrap();
        state.call("ListRolePolicies", &[role])?;
        Ok(state
            .role_mut("ListRolePolicies", role)?
            .inline
            .keys()
            .cloned()
            .collect())
    }

    async fn get_inline_policy(&self, role: &str, name: &str) -> Result<Option<String>, Error> {
        let mut state = self.state.lock().unwrap();
        state.call("GetRolePolicy", &[role, name])?;
        Ok(state
            .role_mut("GetRolePolicy", role)?
            .inline
            .get(name)
            .cloned())
    }

    async fn put_inline_policy(
        &self,
        role: &str,
        name: &str,
        document: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.call("PutRolePolicy", &[role, name])?;
        state
            .role_mut("PutRolePolicy", role)?
            .inline
            .insert(name.to_string(), document.to_string());
        Ok(())
    }

    async fn delete_inline_policy(&self, role: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.call("DeleteRolePolicy", &[role, name])?;
        state
            .role_mut("DeleteRolePolicy", role)?
            .inline
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::iam("DeleteRolePolicy", IamErrorKind::NotFound, name))
    }

    async fn list_managed_policies(&self, role: &str) -> Result<BTreeSet<String>, Error> {
        let mut state = self.state.lock().unwrap();
        state.call("ListAttachedRolePolicies", &[role])?;
        Ok(state
            .role_mut("ListAttachedRolePolicies", role)?
            .managed
            .clone())
    }

    async fn attach_managed_policy(&self, role: &str, arn: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.call("AttachRolePolicy", &[role, arn])?;
        state
            .role_mut("AttachRolePolicy", role)?
            .managed
            .insert(arn.to_string());
        Ok(())
    }

    async fn detach_managed_policy(&self, role: &str, arn: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.call("DetachRolePolicy", &[role, arn])?;
        if state
            .role_mut("DetachRolePolicy", role)?
            .managed
            .remove(arn)
        {
            Ok(())
        } else {
            Err(Error::iam("DetachRolePolicy", IamErrorKind::NotFound, arn))
        }
    }
}

// =============================================================================
// Kubernetes
// =============================================================================

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
struct KubeState {
    roles: BTreeMap<Key, IamRole>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    version: u64,
    writes: Vec<String>,
    failing: BTreeSet<&'static str>,
    conflict_next: bool,
}

impl KubeState {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }

    /// Gate a write, logging it when it goes through
    fn write(&mut self, kind: &'static str, namespace: &str, name: &str) -> Result<(), Error> {
        if self.failing.contains(kind) {
            return Err(api_error(
                500,
                "InternalError",
                format!("injected {} failure", kind),
            ));
        }
        if self.conflict_next {
            self.conflict_next = false;
            return Err(Error::conflict(format!("{} {}/{}", kind, namespace, name)));
        }
        self.writes.push(format!("{} {}/{}", kind, namespace, name));
        Ok(())
    }

    fn stored_role(&mut self, role: &IamRole, check_version: bool) -> Result<&mut IamRole, Error> {
        let namespace = role.namespace().unwrap_or_default();
        let name = role.name_any();
        let stored = self
            .roles
            .get_mut(&key(&namespace, &name))
            .ok_or_else(|| api_error(404, "NotFound", format!("iamroles {} not found", name)))?;
        if check_version && stored.metadata.resource_version != role.metadata.resource_version {
            return Err(Error::conflict(format!(
                "iamroles {}: resourceVersion {:?} is stale",
                name, role.metadata.resource_version
            )));
        }
        Ok(stored)
    }
}

/// In-memory Kubernetes store for IamRoles and ServiceAccounts
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<KubeState>,
}

impl FakeKube {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an IamRole as if a user created it
    pub fn insert_role(&self, mut role: IamRole) -> IamRole {
        let mut state = self.state.lock().unwrap();
        role.metadata.resource_version = state.next_version();
        role.metadata.generation.get_or_insert(1);
        let namespace = role.namespace().unwrap_or_default();
        state
            .roles
            .insert(key(&namespace, &role.name_any()), role.clone());
        role
    }

    /// Edit a stored spec as a user would, bumping the generation
    pub fn update_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut IamRoleSpec)) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let role = state.roles.get_mut(&key(namespace, name)).unwrap();
        edit(&mut role.spec);
        role.metadata.resource_version = version;
        role.metadata.generation = role.metadata.generation.map(|g| g + 1);
    }

    /// Request deletion of a stored IamRole
    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let role = state.roles.get_mut(&key(namespace, name)).unwrap();
        role.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        role.metadata.resource_version = version;
        // Without finalizers the API server removes the record at once
        if role.finalizers().is_empty() {
            state.roles.remove(&key(namespace, name));
        }
    }

    /// Seed a ServiceAccount
    pub fn insert_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) {
        let service_account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .insert(key(namespace, name), service_account);
    }

    /// Stored IamRole
    pub fn role(&self, namespace: &str, name: &str) -> Option<IamRole> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(&key(namespace, name))
            .cloned()
    }

    /// Stored ServiceAccount
    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .get(&key(namespace, name))
            .cloned()
    }

    /// Fail every write of `kind` (e.g. `finalizers`) with a server error
    pub fn fail_writes(&self, kind: &'static str) {
        self.state.lock().unwrap().failing.insert(kind);
    }

    /// Make the next write lose an optimistic-concurrency race
    pub fn conflict_next_write(&self) {
        self.state.lock().unwrap().conflict_next = true;
    }

    /// Successful writes in order, e.g. `status.arn ns1/r1`
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_iam_role(&self, namespace: &str, name: &str) -> Result<Option<IamRole>, Error> {
        Ok(self.role(namespace, name))
    }

    async fn set_finalizers(
        &self,
        role: &IamRole,
        finalizers: Vec<String>,
    ) -> Result<IamRole, Error> {
        let mut state = self.state.lock().unwrap();
        state.stored_role(role, true)?;
        state.write("finalizers", &role.namespace().unwrap_or_default(), &role.name_any())?;

        let version = state.next_version();
        let stored = state.stored_role(role, false)?;
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = version;
        let updated = stored.clone();

        // The API server drops a tombstoned object once its finalizers are gone
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            let namespace = updated.namespace().unwrap_or_default();
            state.roles.remove(&key(&namespace, &updated.name_any()));
        }
        Ok(updated)
    }

    async fn set_role_arn(&self, role: &IamRole, arn: &str) -> Result<IamRole, Error> {
        let mut state = self.state.lock().unwrap();
        state.stored_role(role, true)?;
        state.write("status.arn", &role.namespace().unwrap_or_default(), &role.name_any())?;

        let version = state.next_version();
        let stored = state.stored_role(role, false)?;
        stored
            .status
            .get_or_insert_with(IamRoleStatus::default)
            .arn = Some(arn.to_string());
        stored.metadata.resource_version = version;
        Ok(stored.clone())
    }

    async fn set_ready_condition(
        &self,
        role: &IamRole,
        condition: Condition,
        observed_generation: Option<i64>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.stored_role(role, false)?;
        state.write(
            "status.conditions",
            &role.namespace().unwrap_or_default(),
            &role.name_any(),
        )?;

        let version = state.next_version();
        let stored = state.stored_role(role, false)?;
        let status = stored.status.get_or_insert_with(IamRoleStatus::default);
        status.conditions = merge_condition(&status.conditions, condition);
        if observed_generation.is_some() {
            status.observed_generation = observed_generation;
        }
        stored.metadata.resource_version = version;
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        Ok(self.service_account(namespace, name))
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            if state.service_accounts.contains_key(&key(namespace, name)) {
                return Err(Error::conflict(format!(
                    "serviceaccounts {} already exists",
                    name
                )));
            }
            state.write("serviceaccount.create", namespace, name)?;
        }
        self.insert_service_account(namespace, name, annotations);
        Ok(())
    }

    async fn annotate_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotation: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.write("serviceaccount.annotate", namespace, name)?;
        let service_account = state
            .service_accounts
            .get_mut(&key(namespace, name))
            .ok_or_else(|| {
                api_error(404, "NotFound", format!("serviceaccounts {} not found", name))
            })?;
        service_account
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(annotation.to_string(), value.to_string());
        Ok(())
    }
}

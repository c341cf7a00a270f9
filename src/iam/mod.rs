//! IAM backend gateway
//!
//! [`IamGateway`] is the CRUD surface the reconciler drives. Every call is a
//! single request with its own deadline; nothing here retries or caches.

pub mod aws;
pub mod document;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use aws::AwsIamGateway;

/// Tag naming the IamRole (`<namespace>/<name>`) a role was created for
pub const OWNER_TAG: &str = "iam-role-operator/owner";

/// Tag marking roles created by this operator
pub const MANAGED_BY_TAG: &str = "iam-role-operator/managed-by";

/// Value of [`MANAGED_BY_TAG`]
pub const MANAGED_BY_VALUE: &str = "iam-role-operator";

/// Live state of an IAM role
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteRole {
    /// Role ARN
    pub arn: String,
    /// Role tags
    pub tags: BTreeMap<String, String>,
}

impl RemoteRole {
    /// Owner recorded on the role, if any
    pub fn owner(&self) -> Option<&str> {
        self.tags.get(OWNER_TAG).map(String::as_str)
    }
}

/// Parameters of a CreateRole call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRoleRequest {
    /// Role name
    pub name: String,
    /// JSON trust document
    pub trust_document: String,
    /// Tags applied at creation
    pub tags: BTreeMap<String, String>,
}

/// Owner tags for a role created on behalf of `owner_key`
pub fn owner_tags(owner_key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_TAG.to_string(), owner_key.to_string()),
        (MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// Role and policy operations on the IAM backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamGateway: Send + Sync {
    /// Fetch a role, `None` if it does not exist
    async fn get_role(&self, name: &str) -> Result<Option<RemoteRole>, Error>;

    /// Create a role and return its ARN
    async fn create_role(&self, request: CreateRoleRequest) -> Result<String, Error>;

    /// Delete a role; an absent role is success
    async fn delete_role(&self, name: &str) -> Result<(), Error>;

    /// Names of the inline policies embedded on a role
    async fn list_inline_policies(&self, role: &str) -> Result<BTreeSet<String>, Error>;

    /// JSON document of one inline policy, `None` if it does not exist
    async fn get_inline_policy(&self, role: &str, name: &str) -> Result<Option<String>, Error>;

    /// Create or replace an inline policy
    async fn put_inline_policy(&self, role: &str, name: &str, document: &str)
        -> Result<(), Error>;

    /// Delete an inline policy
    async fn delete_inline_policy(&self, role: &str, name: &str) -> Result<(), Error>;

    /// ARNs of the managed policies attached to a role
    async fn list_managed_policies(&self, role: &str) -> Result<BTreeSet<String>, Error>;

    /// Attach a managed policy
    async fn attach_managed_policy(&self, role: &str, arn: &str) -> Result<(), Error>;

    /// Detach a managed policy
    async fn detach_managed_policy(&self, role: &str, arn: &str) -> Result<(), Error>;
}

//! AWS IAM gateway over `aws-sdk-iam`.
//!
//! Each call is bounded by the configured deadline. SDK error codes are
//! folded into [`IamErrorKind`] so the reconciler never sees SDK types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_iam::types::Tag;
use tracing::{debug, info};

use super::{CreateRoleRequest, IamGateway, RemoteRole};
use crate::error::IamErrorKind;
use crate::Error;

/// Description set on roles the operator creates
const ROLE_DESCRIPTION: &str = "Managed by iam-role-operator";

/// [`IamGateway`] backed by the AWS IAM API
#[derive(Clone, Debug)]
pub struct AwsIamGateway {
    client: aws_sdk_iam::Client,
    call_timeout: Duration,
}

impl AwsIamGateway {
    /// Wrap an existing client
    pub fn new(client: aws_sdk_iam::Client, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    /// Build a client from the default AWS credential chain
    pub async fn from_env(region: Option<String>, call_timeout: Duration) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region.clone() {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        info!(
            region = ?sdk_config.region().map(|r| r.as_ref().to_string()).or(region),
            timeout_secs = call_timeout.as_secs(),
            "AWS IAM client initialized"
        );

        Self::new(aws_sdk_iam::Client::new(&sdk_config), call_timeout)
    }

    /// Await one SDK call under the deadline, translating its failure
    async fn call<T, E, R, F>(&self, operation: &'static str, request: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, SdkError<E, R>>>,
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: Debug,
    {
        match tokio::time::timeout(self.call_timeout, request).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(sdk_error(operation, e)),
            Err(_) => Err(Error::iam(
                operation,
                IamErrorKind::Timeout,
                format!("no response within {}s", self.call_timeout.as_secs_f64()),
            )),
        }
    }
}

fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    let kind = match &err {
        SdkError::TimeoutError(_) => IamErrorKind::Timeout,
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => IamErrorKind::Unavailable,
        _ => kind_for_code(err.code()),
    };
    Error::iam(operation, kind, DisplayErrorContext(&err).to_string())
}

/// Classify an IAM error code
fn kind_for_code(code: Option<&str>) -> IamErrorKind {
    match code {
        Some("NoSuchEntity") => IamErrorKind::NotFound,
        Some("EntityAlreadyExists") => IamErrorKind::AlreadyExists,
        Some(
            "AccessDenied"
            | "AccessDeniedException"
            | "UnauthorizedOperation"
            | "InvalidClientTokenId"
            | "ExpiredToken",
        ) => IamErrorKind::Unauthorized,
        Some("Throttling" | "ThrottlingException" | "RequestLimitExceeded") => {
            IamErrorKind::Throttled
        }
        Some("ServiceFailure" | "ServiceUnavailable") => IamErrorKind::Unavailable,
        Some("MalformedPolicyDocument" | "ValidationError" | "InvalidInput" | "LimitExceeded") => {
            IamErrorKind::Invalid
        }
        _ => IamErrorKind::Other,
    }
}

fn not_found_as_none<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.iam_kind() == Some(IamErrorKind::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn build_tags(tags: &BTreeMap<String, String>) -> Result<Vec<Tag>, Error> {
    tags.iter()
        .map(|(key, value)| {
            Tag::builder()
                .key(key)
                .value(value)
                .build()
                .map_err(|e| Error::iam("CreateRole", IamErrorKind::Other, e.to_string()))
        })
        .collect()
}

#[async_trait]
impl IamGateway for AwsIamGateway {
    async fn get_role(&self, name: &str) -> Result<Option<RemoteRole>, Error> {
        let output = not_found_as_none(
            self.call("GetRole", self.client.get_role().role_name(name).send())
                .await,
        )?;

        let Some(role) = output.as_ref().and_then(|o| o.role()) else {
            return Ok(None);
        };

        Ok(Some(RemoteRole {
            arn: role.arn().to_string(),
            tags: role
                .tags()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect(),
        }))
    }

    async fn create_role(&self, request: CreateRoleRequest) -> Result<String, Error> {
        let tags = build_tags(&request.tags)?;
        let output = self
            .call(
                "CreateRole",
                self.client
                    .create_role()
                    .role_name(&request.name)
                    .assume_role_policy_document(&request.trust_document)
                    .description(ROLE_DESCRIPTION)
                    .set_tags(Some(tags))
                    .send(),
            )
            .await?;

        let arn = output
            .role()
            .map(|r| r.arn().to_string())
            .ok_or_else(|| {
                Error::iam(
                    "CreateRole",
                    IamErrorKind::Other,
                    format!("response for role {} carried no role", request.name),
                )
            })?;
        debug!(role = %request.name, arn = %arn, "created IAM role");
        Ok(arn)
    }

    async fn delete_role(&self, name: &str) -> Result<(), Error> {
        let deleted = not_found_as_none(
            self.call("DeleteRole", self.client.delete_role().role_name(name).send())
                .await,
        )?;
        if deleted.is_none() {
            debug!(role = %name, "IAM role already absent");
        }
        Ok(())
    }

    async fn list_inline_policies(&self, role: &str) -> Result<BTreeSet<String>, Error> {
        let mut names = BTreeSet::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .call(
                    "ListRolePolicies",
                    self.client
                        .list_role_policies()
                        .role_name(role)
                        .set_marker(marker.take())
                        .send(),
                )
                .await?;
            names.extend(output.policy_names().iter().cloned());
            match output.marker() {
                Some(next) if output.is_truncated() => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(names)
    }

    async fn get_inline_policy(&self, role: &str, name: &str) -> Result<Option<String>, Error> {
        let output = not_found_as_none(
            self.call(
                "GetRolePolicy",
                self.client
                    .get_role_policy()
                    .role_name(role)
                    .policy_name(name)
                    .send(),
            )
            .await,
        )?;
        let Some(output) = output else {
            return Ok(None);
        };

        // IAM returns documents URL-encoded
        let document = urlencoding::decode(output.policy_document())
            .map_err(|e| Error::serialization(format!("policy {} on {}: {}", name, role, e)))?;
        Ok(Some(document.into_owned()))
    }

    async fn put_inline_policy(
        &self,
        role: &str,
        name: &str,
        document: &str,
    ) -> Result<(), Error> {
        self.call(
            "PutRolePolicy",
            self.client
                .put_role_policy()
                .role_name(role)
                .policy_name(name)
                .policy_document(document)
                .send(),
        )
        .await?;
        debug!(role = %role, policy = %name, "put inline policy");
        Ok(())
    }

    async fn delete_inline_policy(&self, role: &str, name: &str) -> Result<(), Error> {
        self.call(
            "DeleteRolePolicy",
            self.client
                .delete_role_policy()
                .role_name(role)
                .policy_name(name)
                .send(),
        )
        .await?;
        debug!(role = %role, policy = %name, "deleted inline policy");
        Ok(())
    }

    async fn list_managed_policies(&self, role: &str) -> Result<BTreeSet<String>, Error> {
        let mut arns = BTreeSet::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .call(
                    "ListAttachedRolePolicies",
                    self.client
                        .list_attached_role_policies()
                        .role_name(role)
                        .set_marker(marker.take())
                        .send(),
                )
                .await?;
            arns.extend(
                output
                    .attached_policies()
                    .iter()
                    .filter_map(|p| p.policy_arn())
                    .map(str::to_string),
            );
            match output.marker() {
                Some(next) if output.is_truncated() => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(arns)
    }

    async fn attach_managed_policy(&self, role: &str, arn: &str) -> Result<(), Error> {
        self.call(
            "AttachRolePolicy",
            self.client
                .attach_role_policy()
                .role_name(role)
                .policy_arn(arn)
                .send(),
        )
        .await?;
        debug!(role = %role, policy_arn = %arn, "attached managed policy");
        Ok(())
    }

    async fn detach_managed_policy(&self, role: &str, arn: &str) -> Result<(), Error> {
        self.call(
            "DetachRolePolicy",
            self.client
                .detach_role_policy()
                .role_name(role)
                .policy_arn(arn)
                .send(),
        )
        .await?;
        debug!(role = %role, policy_arn = %arn, "detached managed policy");
        Ok(())
    }
}

//! iam-role-operator - AWS IAM roles for Kubernetes ServiceAccounts
//!
//! An `IamRole` custom resource declares an IAM role, the inline and managed
//! policies it carries, and the ServiceAccount allowed to assume it through
//! the cluster's OIDC provider. The operator creates the role, keeps its
//! policies in sync, annotates the ServiceAccount with the role ARN, and
//! deletes the role when the resource goes away.
//!
//! # Modules
//!
//! - [`crd`] - The IamRole Custom Resource Definition
//! - [`controller`] - Reconciliation logic
//! - [`iam`] - IAM gateway trait, AWS adapter and policy documents
//! - [`config`] - Command-line and environment configuration
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Requeue backoff
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod iam;
pub mod retry;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation EKS reads to inject web-identity credentials into pods
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

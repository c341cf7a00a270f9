//! Controller implementation for the IamRole CRD
//!
//! Reconciliation follows the observe-diff-act pattern: every pass re-reads
//! the record and the IAM backend, then applies only what differs.

pub mod binding;
pub mod finalizer;
mod iam_role;
pub mod kube_client;
pub mod policy_sync;
pub mod role;

pub use finalizer::{Lifecycle, FINALIZER};
pub use iam_role::{error_policy, reconcile, Context, ContextBuilder, CONTROLLER_NAME};
pub use kube_client::{KubeClient, KubeClientImpl};

//! Custom Resource Definitions for the IamRole operator

mod iam_role;
mod types;

pub use iam_role::{IamRole, IamRoleSpec, IamRoleStatus};
pub use types::{Condition, ConditionStatus, InlinePolicy, PolicyEffect};

//! Operator configuration
//!
//! Command-line flags with environment fallbacks, validated into an
//! [`OperatorConfig`] before the controller starts.

use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::retry::BackoffConfig;
use crate::Error;

/// How narrowly the trust document matches the ServiceAccount token subject
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubjectScope {
    /// Only `system:serviceaccount:<namespace>:<serviceAccount>`
    #[default]
    ServiceAccount,
    /// Any ServiceAccount token from the issuer
    Unscoped,
}

/// Inputs of the trust document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustSettings {
    /// AWS account that owns the OIDC provider
    pub account_id: String,
    /// OIDC issuer host and path, without scheme
    pub oidc_issuer: String,
    /// Subject matching mode
    pub subject_scope: SubjectScope,
}

impl TrustSettings {
    /// Build trust settings, normalizing and validating the inputs
    pub fn new(
        account_id: impl Into<String>,
        issuer_url: &str,
        subject_scope: SubjectScope,
    ) -> Result<Self, Error> {
        let account_id = account_id.into();
        if account_id.len() != 12 || !account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::config(format!(
                "AWS account id must be 12 digits, got '{}'",
                account_id
            )));
        }

        let oidc_issuer = issuer_url
            .trim()
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string();
        if oidc_issuer.is_empty() {
            return Err(Error::config("OIDC issuer URL must not be empty"));
        }

        Ok(Self {
            account_id,
            oidc_issuer,
            subject_scope,
        })
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Controller flags
#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// AWS region for the IAM client (IAM itself is global)
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// AWS account id that owns the cluster's OIDC provider
    #[arg(long, env = "AWS_ACCOUNT_ID")]
    pub aws_account_id: Option<String>,

    /// Cluster OIDC issuer URL (e.g. https://oidc.eks.us-east-1.amazonaws.com/id/ABC)
    #[arg(long, env = "OPENID_ISSUER_URL")]
    pub oidc_issuer_url: Option<String>,

    /// Let any ServiceAccount token from the issuer assume created roles
    #[arg(long, env = "UNSCOPED_TRUST_SUBJECT")]
    pub unscoped_trust_subject: bool,

    /// Deadline for each IAM API call
    #[arg(long, env = "IAM_CALL_TIMEOUT_SECS", default_value = "10")]
    pub iam_call_timeout_secs: u64,

    /// Requeue interval for converged roles (drift detection)
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value = "300")]
    pub resync_interval_secs: u64,

    /// Requeue interval after a permanent error
    #[arg(long, env = "PERMANENT_ERROR_REQUEUE_SECS", default_value = "600")]
    pub permanent_error_requeue_secs: u64,

    /// First backoff delay after a transient error
    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value = "1000")]
    pub backoff_initial_ms: u64,

    /// Upper bound of the transient error backoff
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value = "300")]
    pub backoff_max_secs: u64,

    /// Maximum number of IamRoles reconciled concurrently
    #[arg(long, env = "CONCURRENCY", default_value = "4")]
    pub concurrency: u16,

    /// Only watch IamRoles in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Settings the reconciler reads on every pass
#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    /// Trust document inputs
    pub trust: TrustSettings,
    /// Requeue interval for converged roles
    pub resync_interval: Duration,
    /// Requeue interval after a permanent error
    pub permanent_error_requeue: Duration,
    /// Backoff for transient errors
    pub backoff: BackoffConfig,
}

impl ReconcilerSettings {
    /// Settings with default intervals for the given trust configuration
    pub fn new(trust: TrustSettings) -> Self {
        Self {
            trust,
            resync_interval: Duration::from_secs(300),
            permanent_error_requeue: Duration::from_secs(600),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Validated operator configuration
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// AWS region override
    pub aws_region: Option<String>,
    /// Deadline for each IAM API call
    pub iam_call_timeout: Duration,
    /// Maximum concurrent reconciles
    pub concurrency: u16,
    /// Namespace filter
    pub watch_namespace: Option<String>,
    /// Reconciler settings
    pub reconciler: ReconcilerSettings,
}

impl TryFrom<OperatorArgs> for OperatorConfig {
    type Error = Error;

    fn try_from(args: OperatorArgs) -> Result<Self, Self::Error> {
        let account_id = args
            .aws_account_id
            .ok_or_else(|| Error::config("AWS_ACCOUNT_ID is required"))?;
        let issuer = args
            .oidc_issuer_url
            .ok_or_else(|| Error::config("OPENID_ISSUER_URL is required"))?;

        let subject_scope = if args.unscoped_trust_subject {
            SubjectScope::Unscoped
        } else {
            SubjectScope::ServiceAccount
        };
        let trust = TrustSettings::new(account_id, &issuer, subject_scope)?;

        if args.iam_call_timeout_secs == 0 {
            return Err(Error::config("IAM call timeout must be positive"));
        }
        if args.concurrency == 0 {
            return Err(Error::config("concurrency must be positive"));
        }

        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(args.backoff_initial_ms.max(1)),
            max_delay: Duration::from_secs(args.backoff_max_secs.max(1)),
            ..Default::default()
        };

        Ok(Self {
            aws_region: args.aws_region,
            iam_call_timeout: Duration::from_secs(args.iam_call_timeout_secs),
            concurrency: args.concurrency,
            watch_namespace: args.watch_namespace,
            reconciler: ReconcilerSettings {
                trust,
                resync_interval: Duration::from_secs(args.resync_interval_secs.max(1)),
                permanent_error_requeue: Duration::from_secs(
                    args.permanent_error_requeue_secs.max(1),
                ),
                backoff,
            },
        })
    }
}

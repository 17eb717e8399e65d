//! Infrastructure reconcilers
//!
//! A provider turns the desired destinations into cloud infrastructure. The
//! controller only sees the [`Provider`] trait; which variant runs is decided
//! once at startup.

pub mod aws;
pub mod noop;

use std::time::Duration;

use async_trait::async_trait;
use static_egress_common::DesiredState;
use thiserror::Error;

use self::aws::api::ApiError;
use self::aws::template::TemplateError;

pub use self::aws::AwsProvider;
pub use self::noop::NoopProvider;

/// Reconciles cloud infrastructure with the desired destinations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    /// Brings the infrastructure in line with `configs`.
    ///
    /// Receives the complete desired state every time; implementations must
    /// be idempotent.
    async fn ensure(&self, configs: &DesiredState) -> Result<(), ProviderError>;
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Stack {0} already exists")]
    AlreadyExists(String),

    #[error("Stack {0} does not exist")]
    DoesNotExist(String),

    #[error("No VPC found")]
    NoVpc,

    #[error("Found {0} VPCs and none is marked as default, configure the VPC id explicitly")]
    AmbiguousVpc(usize),

    #[error("No internet gateway attached to VPC {0}")]
    NoInternetGateway(String),

    #[error("No route tables tagged for egress found in VPC {0}")]
    NoRouteTables(String),

    #[error("Route table {route_table} is tagged with unknown availability zone {zone}")]
    UnknownZone { route_table: String, zone: String },

    #[error("Stack {stack} ended in status {status}: {reason}")]
    StackFailed {
        stack: String,
        status: String,
        reason: String,
    },

    #[error("Timed out after {timeout:?} waiting for stack {stack} to {operation}")]
    Timeout {
        stack: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Cancelled while waiting for stack {0}")]
    Cancelled(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Infrastructure API call failed: {0}")]
    Api(#[from] ApiError),
}

/// Provider selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Log the desired routes and do nothing else.
    Noop,
    /// Maintain a CloudFormation stack of NAT gateways.
    Aws,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Noop => f.write_str(noop::PROVIDER_NAME),
            Self::Aws => f.write_str(aws::PROVIDER_NAME),
        }
    }
}

//! Command line configuration
//!
//! Every flag can also be given through a `STATIC_EGRESS_*` environment
//! variable. Zones and NAT blocks accept comma separated values from the
//! environment. Tag values may contain commas, so tags are never split.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnet::Ipv4Net;
use thiserror::Error;

use crate::provider::aws::{
    AwsProviderConfig, WaitConfig, DEFAULT_CLUSTER_ID_TAG_PREFIX, DEFAULT_CONTROLLER_ID,
};
use crate::provider::ProviderKind;
use crate::telemetry::LogFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("The aws provider requires at least one availability zone")]
    NoAvailabilityZones,

    #[error("Expected one NAT CIDR block per availability zone, got {blocks} blocks for {zones} zones")]
    NatBlockCount { zones: usize, blocks: usize },

    #[error("Invalid NAT CIDR block {0}")]
    InvalidNatBlock(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Parser)]
#[command(name = "kube-static-egress-controller")]
#[command(about = "Maintains static egress NAT gateways for destination networks", long_about = None)]
#[command(version)]
pub struct OperatorConfig {
    /// Provider reconciling the egress infrastructure
    #[arg(long, env = "STATIC_EGRESS_PROVIDER", value_enum, default_value = "noop")]
    pub provider: ProviderKind,

    /// Kubeconfig file, in-cluster configuration is used when unset
    #[arg(long, env = "STATIC_EGRESS_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch for egress ConfigMaps, all namespaces when unset
    #[arg(long, env = "STATIC_EGRESS_NAMESPACE")]
    pub namespace: Option<String>,

    /// Identity of the cluster, used in the stack name and ownership tag
    #[arg(long, env = "STATIC_EGRESS_CLUSTER_ID", default_value = "")]
    pub cluster_id: String,

    #[arg(long, env = "STATIC_EGRESS_CLUSTER_ID_TAG_PREFIX", default_value = DEFAULT_CLUSTER_ID_TAG_PREFIX)]
    pub cluster_id_tag_prefix: String,

    /// Value of the application tag on managed stacks
    #[arg(long, env = "STATIC_EGRESS_CONTROLLER_ID", default_value = DEFAULT_CONTROLLER_ID)]
    pub controller_id: String,

    /// VPC to place NAT gateways in, discovered when unset
    #[arg(long, env = "STATIC_EGRESS_VPC_ID")]
    pub vpc_id: Option<String>,

    /// NAT subnet block, one per availability zone in the same order
    #[arg(
        long = "aws-nat-cidr-block",
        env = "STATIC_EGRESS_AWS_NAT_CIDR_BLOCKS",
        value_delimiter = ','
    )]
    pub nat_cidr_blocks: Vec<String>,

    /// Availability zone to create a NAT gateway in
    #[arg(long = "aws-az", env = "STATIC_EGRESS_AWS_AZS", value_delimiter = ',')]
    pub availability_zones: Vec<String>,

    /// Enable termination protection on the stack
    #[arg(long, env = "STATIC_EGRESS_STACK_TERMINATION_PROTECTION")]
    pub stack_termination_protection: bool,

    /// Extra stack tag as key=value
    #[arg(
        long = "additional-stack-tags",
        env = "STATIC_EGRESS_ADDITIONAL_STACK_TAGS",
        value_parser = parse_key_val
    )]
    pub additional_stack_tags: Vec<(String, String)>,

    /// Bucket to upload templates to instead of passing them inline
    #[arg(long, env = "STATIC_EGRESS_CF_TEMPLATE_BUCKET")]
    pub cf_template_bucket: Option<String>,

    /// Interval between unconditional syncs
    #[arg(long, env = "STATIC_EGRESS_RESYNC_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub resync_interval: Duration,

    /// How long to wait for a stack operation to finish
    #[arg(long, env = "STATIC_EGRESS_STACK_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    pub stack_timeout: Duration,

    #[arg(long, env = "STATIC_EGRESS_STACK_POLL_INTERVAL", default_value = "15s", value_parser = humantime::parse_duration)]
    pub stack_poll_interval: Duration,

    /// Log the stack changes instead of applying them
    #[arg(long, env = "STATIC_EGRESS_DRY_RUN")]
    pub dry_run: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "STATIC_EGRESS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "STATIC_EGRESS_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Address of the health and metrics server
    #[arg(long, env = "STATIC_EGRESS_ADDRESS", default_value = "0.0.0.0:8080")]
    pub address: SocketAddr,
}

/// Parses `key=value`, rejecting values that contain another `=`.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.split('=').collect();
    match parts.as_slice() {
        [key, value] if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("Resync interval"));
        }

        if self.provider != ProviderKind::Aws {
            return Ok(());
        }

        if self.stack_poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("Stack poll interval"));
        }
        if self.availability_zones.is_empty() {
            return Err(ConfigError::NoAvailabilityZones);
        }
        if self.nat_cidr_blocks.len() != self.availability_zones.len() {
            return Err(ConfigError::NatBlockCount {
                zones: self.availability_zones.len(),
                blocks: self.nat_cidr_blocks.len(),
            });
        }
        if let Some(block) = self
            .nat_cidr_blocks
            .iter()
            .find(|b| b.parse::<Ipv4Net>().is_err())
        {
            return Err(ConfigError::InvalidNatBlock(block.clone()));
        }

        Ok(())
    }

    pub fn aws_provider_config(&self) -> AwsProviderConfig {
        AwsProviderConfig {
            cluster_id: self.cluster_id.clone(),
            cluster_id_tag_prefix: self.cluster_id_tag_prefix.clone(),
            controller_id: self.controller_id.clone(),
            dry_run: self.dry_run,
            vpc_id: self.vpc_id.clone(),
            nat_cidr_blocks: self.nat_cidr_blocks.clone(),
            availability_zones: self.availability_zones.clone(),
            stack_termination_protection: self.stack_termination_protection,
            additional_stack_tags: self
                .additional_stack_tags
                .iter()
                .cloned()
                .collect::<BTreeMap<_, _>>(),
            wait: WaitConfig {
                poll_interval: self.stack_poll_interval,
                timeout: self.stack_timeout,
            },
        }
    }
}

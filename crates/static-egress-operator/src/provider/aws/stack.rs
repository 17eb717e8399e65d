//! Stack specification, ownership tags and status classification

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

use super::api::{Parameter, RouteTable, StackStatus, Tag};
use super::template::{route_table_parameter, INTERNET_GATEWAY_PARAMETER, VPC_PARAMETER};
use crate::provider::ProviderError;

/// Tag key marking the route tables that receive egress routes.
pub const ROUTE_TABLE_TYPE_TAG: &str = "Type";
pub const ROUTE_TABLE_TYPE_VALUE: &str = "dmz";
/// Tag key carrying the availability zone of a route table.
pub const ZONE_TAG: &str = "AvailabilityZone";
const NAME_TAG: &str = "Name";

pub const APPLICATION_TAG: &str = "kubernetes:application";
pub const RESOURCE_LIFECYCLE_OWNED: &str = "owned";

/// Everything needed to submit one create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSpec {
    pub name: String,
    pub vpc_id: String,
    pub internet_gateway_id: String,
    /// Route table id per route table parameter.
    pub route_table_ids: BTreeMap<String, String>,
    pub template: String,
    pub tags: Vec<Tag>,
    pub termination_protection: bool,
    pub timeout: Duration,
}

impl StackSpec {
    pub fn parameters(&self) -> Vec<Parameter> {
        let mut parameters: Vec<Parameter> = self
            .route_table_ids
            .iter()
            .map(|(key, value)| Parameter {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        parameters.push(Parameter {
            key: INTERNET_GATEWAY_PARAMETER.to_string(),
            value: self.internet_gateway_id.clone(),
        });
        parameters.push(Parameter {
            key: VPC_PARAMETER.to_string(),
            value: self.vpc_id.clone(),
        });
        parameters
    }

    /// Stack creation timeout, rounded up to whole minutes.
    pub fn timeout_in_minutes(&self) -> u32 {
        let minutes = self.timeout.as_secs().div_ceil(60).max(1);
        u32::try_from(minutes).unwrap_or(u32::MAX)
    }
}

/// Tags identifying stacks managed by this controller instance.
pub fn ownership_tags(
    cluster_id_tag_prefix: &str,
    cluster_id: &str,
    controller_id: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            format!("{cluster_id_tag_prefix}{cluster_id}"),
            RESOURCE_LIFECYCLE_OWNED.to_string(),
        ),
        (APPLICATION_TAG.to_string(), controller_id.to_string()),
    ])
}

/// User tags merged with the ownership tags. Ownership tags win on conflict.
pub fn merge_tags(
    additional: &BTreeMap<String, String>,
    ownership: &BTreeMap<String, String>,
) -> Vec<Tag> {
    let mut merged = additional.clone();
    merged.extend(ownership.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.into_iter().map(|(k, v)| Tag::new(k, v)).collect()
}

/// Whether every expected key is present in `tags` with the expected value.
pub fn has_tags(expected: &BTreeMap<String, String>, tags: &[Tag]) -> bool {
    expected
        .iter()
        .all(|(key, value)| tags.iter().any(|t| &t.key == key && &t.value == value))
}

/// Stack name derived from the cluster id.
///
/// Stack names allow ASCII letters, digits and hyphens only; anything else
/// is replaced by a hyphen.
pub fn stack_name(prefix: &str, cluster_id: &str) -> String {
    if cluster_id.is_empty() {
        return prefix.to_string();
    }
    let suffix: String = cluster_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{prefix}-{suffix}")
}

/// Operation a wait loop is observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperation {
    Create,
    Update,
    Delete,
    /// Waiting for a change started elsewhere to finish.
    Settle,
}

impl StackOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Settle => "settle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Complete,
    Failed,
    Pending,
}

fn is_failure(status: &StackStatus) -> bool {
    let status = status.as_str();
    status.contains("FAILED") || status.contains("ROLLBACK")
}

/// Classifies an observed status for the operation being waited on.
pub fn classify(operation: StackOperation, status: &StackStatus) -> Progress {
    use StackStatus::*;

    match operation {
        StackOperation::Create => match status {
            CreateComplete => Progress::Complete,
            DeleteComplete | DeleteInProgress => Progress::Failed,
            s if is_failure(s) => Progress::Failed,
            _ => Progress::Pending,
        },
        StackOperation::Update => match status {
            UpdateComplete | UpdateCompleteCleanupInProgress => Progress::Complete,
            DeleteComplete | DeleteInProgress => Progress::Failed,
            s if is_failure(s) => Progress::Failed,
            _ => Progress::Pending,
        },
        StackOperation::Delete => match status {
            DeleteComplete => Progress::Complete,
            DeleteFailed => Progress::Failed,
            _ => Progress::Pending,
        },
        StackOperation::Settle => {
            if status.is_in_progress() {
                Progress::Pending
            } else {
                Progress::Complete
            }
        }
    }
}

/// Route tables bound to stack parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTableAssignment {
    /// Parameter names in ordinal order.
    pub parameters: Vec<String>,
    pub table_ids: BTreeMap<String, String>,
    pub zone_index: BTreeMap<String, usize>,
}

/// Binds discovered route tables to `AZ<n>RouteTableIDParameter` slots.
///
/// Tables named `dmz-<zone>` come first in zone order so parameter names stay
/// stable for stacks created before zone tags existed; the rest follow by id.
/// A table without zone tag routes through the first zone.
pub fn assign_route_tables(
    availability_zones: &[String],
    mut tables: Vec<RouteTable>,
) -> Result<RouteTableAssignment, ProviderError> {
    let legacy_position = |table: &RouteTable| {
        table.tag(NAME_TAG).and_then(|name| {
            availability_zones
                .iter()
                .position(|zone| name == format!("dmz-{zone}"))
        })
    };

    tables.sort_by(|a, b| {
        let key = |t: &RouteTable| match legacy_position(t) {
            Some(position) => (0, position),
            None => (1, 0),
        };
        key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
    });

    let mut assignment = RouteTableAssignment::default();
    for (i, table) in tables.into_iter().enumerate() {
        let parameter = route_table_parameter(i + 1);

        let zone_index = match table.tag(ZONE_TAG) {
            Some(zone) => availability_zones
                .iter()
                .position(|z| z == zone)
                .ok_or_else(|| ProviderError::UnknownZone {
                    route_table: table.id.clone(),
                    zone: zone.to_string(),
                })?,
            None => {
                warn!(
                    route_table = %table.id,
                    tag = ZONE_TAG,
                    "Route table has no zone tag, routing through the first zone"
                );
                0
            }
        };

        assignment.parameters.push(parameter.clone());
        assignment.zone_index.insert(parameter.clone(), zone_index);
        assignment.table_ids.insert(parameter, table.id);
    }

    Ok(assignment)
}

//! CloudFormation backed provider
//!
//! All egress infrastructure of a cluster lives in a single stack: one NAT
//! gateway with an elastic IP per availability zone, plus one route per
//! destination and route table. Every `ensure` call compares the routes in
//! the live template with the desired routes and creates, updates or deletes
//! the stack accordingly.

pub mod api;
#[cfg(feature = "aws-sdk")]
pub mod sdk;
pub mod stack;
pub mod template;

#[cfg(test)]
mod fake;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use static_egress_common::{aggregate_routes, DesiredState};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use self::api::{
    CloudFormationApi, CreateStackRequest, Ec2Api, Stack, StackStatus, TemplateSource,
    TemplateUploader, UpdateStackRequest,
};
use self::stack::{
    assign_route_tables, classify, has_tags, merge_tags, ownership_tags, stack_name, Progress,
    StackOperation, StackSpec, ROUTE_TABLE_TYPE_TAG, ROUTE_TABLE_TYPE_VALUE,
};
use self::template::{build_template, cidrs_from_template};
use super::{Provider, ProviderError};

pub const PROVIDER_NAME: &str = "aws";

/// Name of stacks created before stacks were named per cluster.
pub const LEGACY_STACK_NAME: &str = "egress-static-nat";
const STACK_NAME_PREFIX: &str = "egress-static-nat";

pub const DEFAULT_CLUSTER_ID_TAG_PREFIX: &str = "kubernetes.io/cluster/";
pub const DEFAULT_CONTROLLER_ID: &str = "kube-static-egress-controller";

/// How long to wait for a stack operation and how often to poll it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AwsProviderConfig {
    pub cluster_id: String,
    pub cluster_id_tag_prefix: String,
    pub controller_id: String,
    pub dry_run: bool,
    /// VPC to use; discovered when unset.
    pub vpc_id: Option<String>,
    /// One NAT subnet block per availability zone, same order.
    pub nat_cidr_blocks: Vec<String>,
    pub availability_zones: Vec<String>,
    pub stack_termination_protection: bool,
    pub additional_stack_tags: BTreeMap<String, String>,
    pub wait: WaitConfig,
}

impl Default for AwsProviderConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            cluster_id_tag_prefix: DEFAULT_CLUSTER_ID_TAG_PREFIX.to_string(),
            controller_id: DEFAULT_CONTROLLER_ID.to_string(),
            dry_run: false,
            vpc_id: None,
            nat_cidr_blocks: Vec::new(),
            availability_zones: Vec::new(),
            stack_termination_protection: false,
            additional_stack_tags: BTreeMap::new(),
            wait: WaitConfig::default(),
        }
    }
}

/// Bucket and uploader used to pass templates by URL.
struct TemplateStore {
    bucket: String,
    uploader: Arc<dyn TemplateUploader>,
}

pub struct AwsProvider {
    config: AwsProviderConfig,
    cloudformation: Arc<dyn CloudFormationApi>,
    ec2: Arc<dyn Ec2Api>,
    template_store: Option<TemplateStore>,
    cancel: CancellationToken,
}

impl AwsProvider {
    pub fn new(
        config: AwsProviderConfig,
        cloudformation: Arc<dyn CloudFormationApi>,
        ec2: Arc<dyn Ec2Api>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            cloudformation,
            ec2,
            template_store: None,
            cancel,
        }
    }

    /// Upload templates to `bucket` and reference them by URL.
    pub fn with_template_bucket(
        mut self,
        bucket: impl Into<String>,
        uploader: Arc<dyn TemplateUploader>,
    ) -> Self {
        self.template_store = Some(TemplateStore {
            bucket: bucket.into(),
            uploader,
        });
        self
    }

    /// Name used when this controller creates a new stack.
    pub fn stack_name(&self) -> String {
        stack_name(STACK_NAME_PREFIX, &self.config.cluster_id)
    }

    fn ownership_tags(&self) -> BTreeMap<String, String> {
        ownership_tags(
            &self.config.cluster_id_tag_prefix,
            &self.config.cluster_id,
            &self.config.controller_id,
        )
    }

    /// Finds the managed stack by ownership tags, falling back to the legacy
    /// static name.
    async fn find_stack(&self) -> Result<Option<Stack>, ProviderError> {
        let expected = self.ownership_tags();
        let mut next_token = None;

        loop {
            let page = self.cloudformation.describe_stacks_page(next_token).await?;
            if let Some(stack) = page
                .stacks
                .into_iter()
                .find(|s| s.status != StackStatus::DeleteComplete && has_tags(&expected, &s.tags))
            {
                debug!(stack = %stack.name, status = %stack.status, "Found stack by ownership tags");
                return Ok(Some(stack));
            }

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        match self.cloudformation.describe_stack(LEGACY_STACK_NAME).await {
            Ok(stack) if stack.status != StackStatus::DeleteComplete => {
                info!(stack = %stack.name, "Found legacy stack without ownership tags");
                Ok(Some(stack))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_does_not_exist() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_vpc(&self) -> Result<String, ProviderError> {
        if let Some(vpc_id) = &self.config.vpc_id {
            return Ok(vpc_id.clone());
        }

        let vpcs = self.ec2.describe_vpcs().await?;
        match vpcs.as_slice() {
            [] => Err(ProviderError::NoVpc),
            [only] => Ok(only.id.clone()),
            many => many
                .iter()
                .find(|vpc| vpc.is_default)
                .map(|vpc| vpc.id.clone())
                .ok_or(ProviderError::AmbiguousVpc(many.len())),
        }
    }

    async fn resolve_internet_gateway(&self, vpc_id: &str) -> Result<String, ProviderError> {
        self.ec2
            .describe_internet_gateways(vpc_id)
            .await?
            .into_iter()
            .next()
            .map(|igw| igw.id)
            .ok_or_else(|| ProviderError::NoInternetGateway(vpc_id.to_string()))
    }

    /// Discovers the network topology and renders the stack for `routes`.
    async fn generate_stack_spec(
        &self,
        name: String,
        routes: &BTreeSet<IpNet>,
    ) -> Result<StackSpec, ProviderError> {
        let vpc_id = self.resolve_vpc().await?;
        let internet_gateway_id = self.resolve_internet_gateway(&vpc_id).await?;

        let tables = self
            .ec2
            .describe_route_tables(&vpc_id, ROUTE_TABLE_TYPE_TAG, ROUTE_TABLE_TYPE_VALUE)
            .await?;
        if tables.is_empty() {
            return Err(ProviderError::NoRouteTables(vpc_id));
        }
        let assignment = assign_route_tables(&self.config.availability_zones, tables)?;

        let template = build_template(
            &self.config.availability_zones,
            &self.config.nat_cidr_blocks,
            &assignment.parameters,
            &assignment.zone_index,
            routes,
        )?;

        Ok(StackSpec {
            name,
            vpc_id,
            internet_gateway_id,
            route_table_ids: assignment.table_ids,
            template,
            tags: merge_tags(&self.config.additional_stack_tags, &self.ownership_tags()),
            termination_protection: self.config.stack_termination_protection,
            timeout: self.config.wait.timeout,
        })
    }

    async fn template_source(&self, spec: &StackSpec) -> Result<TemplateSource, ProviderError> {
        let Some(store) = &self.template_store else {
            return Ok(TemplateSource::Body(spec.template.clone()));
        };

        let key = format!("{}/{}.json", spec.name, chrono::Utc::now().timestamp());
        let url = store
            .uploader
            .upload(&store.bucket, &key, spec.template.clone())
            .await?;
        debug!(bucket = %store.bucket, key = %key, "Uploaded stack template");
        Ok(TemplateSource::Url(url))
    }

    fn log_dry_run(&self, action: &str, spec: &StackSpec) {
        let parameters: Vec<String> = spec
            .parameters()
            .iter()
            .map(|p| format!("{}={}", p.key, p.value))
            .collect();
        info!(
            stack = %spec.name,
            action = action,
            parameters = ?parameters,
            template = %spec.template,
            "Dry run, not submitting stack change"
        );
    }

    async fn create_stack(&self, spec: &StackSpec) -> Result<(), ProviderError> {
        if self.config.dry_run {
            self.log_dry_run("create", spec);
            return Ok(());
        }

        let request = CreateStackRequest {
            name: spec.name.clone(),
            template: self.template_source(spec).await?,
            parameters: spec.parameters(),
            tags: spec.tags.clone(),
            termination_protection: spec.termination_protection,
            timeout_in_minutes: spec.timeout_in_minutes(),
        };

        info!(stack = %spec.name, "Creating stack");
        match self.cloudformation.create_stack(request).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                return Err(ProviderError::AlreadyExists(spec.name.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        self.wait_for(&spec.name, StackOperation::Create).await?;
        Ok(())
    }

    async fn update_stack(&self, current: &Stack, spec: &StackSpec) -> Result<(), ProviderError> {
        if self.config.dry_run {
            self.log_dry_run("update", spec);
            return Ok(());
        }

        if current.termination_protection != spec.termination_protection {
            info!(
                stack = %spec.name,
                enabled = spec.termination_protection,
                "Updating termination protection"
            );
            match self
                .cloudformation
                .update_termination_protection(&spec.name, spec.termination_protection)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_does_not_exist() => {
                    return Err(ProviderError::DoesNotExist(spec.name.clone()))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let request = UpdateStackRequest {
            name: spec.name.clone(),
            template: self.template_source(spec).await?,
            parameters: spec.parameters(),
            tags: spec.tags.clone(),
        };

        info!(stack = %spec.name, "Updating stack");
        match self.cloudformation.update_stack(request).await {
            Ok(()) => {}
            Err(e) if e.is_no_updates() => {
                debug!(stack = %spec.name, "Stack already up to date");
                return Ok(());
            }
            Err(e) if e.is_does_not_exist() => {
                return Err(ProviderError::DoesNotExist(spec.name.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        self.wait_for(&spec.name, StackOperation::Update).await?;
        Ok(())
    }

    async fn delete_stack(&self, stack: &Stack) -> Result<(), ProviderError> {
        if self.config.dry_run {
            info!(stack = %stack.name, "Dry run, not deleting stack");
            return Ok(());
        }

        if stack.termination_protection {
            info!(stack = %stack.name, "Disabling termination protection");
            match self
                .cloudformation
                .update_termination_protection(&stack.name, false)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_does_not_exist() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        info!(stack = %stack.name, "Deleting stack");
        match self.cloudformation.delete_stack(&stack.name).await {
            Ok(()) => {}
            Err(e) if e.is_does_not_exist() => {
                debug!(stack = %stack.name, "Stack already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.wait_for(&stack.name, StackOperation::Delete).await?;
        Ok(())
    }

    /// Creates the stack, updating it instead when another writer created
    /// it first.
    async fn create_or_update(&self, spec: &StackSpec) -> Result<(), ProviderError> {
        match self.create_stack(spec).await {
            Err(ProviderError::AlreadyExists(name)) => {
                warn!(stack = %name, "Stack appeared concurrently, updating instead");
                let current = self.cloudformation.describe_stack(&name).await?;
                self.update_stack(&current, spec).await
            }
            other => other,
        }
    }

    /// Updates the stack, creating it instead when it vanished meanwhile.
    async fn update_or_create(
        &self,
        current: &Stack,
        spec: StackSpec,
    ) -> Result<(), ProviderError> {
        match self.update_stack(current, &spec).await {
            Err(ProviderError::DoesNotExist(name)) => {
                warn!(stack = %name, "Stack disappeared during update, creating it");
                let spec = StackSpec {
                    name: self.stack_name(),
                    ..spec
                };
                self.create_stack(&spec).await
            }
            other => other,
        }
    }

    /// Polls the stack until `operation` finished.
    ///
    /// Returns `None` when the stack is gone. Ends early on cancellation and
    /// fails once the configured timeout elapsed.
    #[instrument(skip(self, operation), fields(operation = operation.as_str()))]
    async fn wait_for(
        &self,
        name: &str,
        operation: StackOperation,
    ) -> Result<Option<Stack>, ProviderError> {
        let deadline = sleep(self.config.wait.timeout);
        tokio::pin!(deadline);

        loop {
            let stack = match self.cloudformation.describe_stack(name).await {
                Ok(stack) => stack,
                Err(e) if e.is_does_not_exist() => {
                    return match operation {
                        StackOperation::Delete | StackOperation::Settle => Ok(None),
                        _ => Err(ProviderError::DoesNotExist(name.to_string())),
                    };
                }
                Err(e) => return Err(e.into()),
            };

            match classify(operation, &stack.status) {
                Progress::Complete => {
                    info!(stack = %name, status = %stack.status, "Stack operation complete");
                    return Ok(Some(stack));
                }
                Progress::Failed => {
                    return Err(ProviderError::StackFailed {
                        stack: name.to_string(),
                        status: stack.status.to_string(),
                        reason: stack.status_reason.unwrap_or_default(),
                    });
                }
                Progress::Pending => {
                    debug!(stack = %name, status = %stack.status, "Waiting for stack");
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(ProviderError::Cancelled(name.to_string()));
                }
                _ = &mut deadline => {
                    return Err(ProviderError::Timeout {
                        stack: name.to_string(),
                        operation: operation.as_str(),
                        timeout: self.config.wait.timeout,
                    });
                }
                _ = sleep(self.config.wait.poll_interval) => {}
            }
        }
    }

    async fn live_routes(&self, name: &str) -> Result<BTreeSet<IpNet>, ProviderError> {
        let body = self.cloudformation.get_template(name).await?;
        Ok(cidrs_from_template(&body)?)
    }
}

#[async_trait]
impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    #[instrument(skip_all, fields(provider = PROVIDER_NAME))]
    async fn ensure(&self, configs: &DesiredState) -> Result<(), ProviderError> {
        let routes = aggregate_routes(configs);
        let mut stack = self.find_stack().await?;

        if stack.is_none() && routes.is_empty() {
            debug!("No stack and no destinations, nothing to do");
            return Ok(());
        }

        if let Some(current) = stack.take() {
            stack = if current.status.is_in_progress() {
                info!(stack = %current.name, status = %current.status, "Waiting for running stack operation");
                self.wait_for(&current.name, StackOperation::Settle)
                    .await?
                    .filter(|s| s.status != StackStatus::DeleteComplete)
            } else {
                Some(current)
            };
        }

        if let Some(current) = stack.take() {
            if current.status == StackStatus::RollbackComplete {
                warn!(stack = %current.name, "Stack failed to create, deleting it before retrying");
                self.delete_stack(&current).await?;
            } else {
                stack = Some(current);
            }
        }

        let Some(current) = stack else {
            if routes.is_empty() {
                return Ok(());
            }
            let spec = self.generate_stack_spec(self.stack_name(), &routes).await?;
            return self.create_or_update(&spec).await;
        };

        if routes.is_empty() {
            return self.delete_stack(&current).await;
        }

        let live = self.live_routes(&current.name).await?;
        let owned = has_tags(&self.ownership_tags(), &current.tags);
        if live == routes && owned {
            debug!(stack = %current.name, routes = routes.len(), "Stack is up to date");
            return Ok(());
        }

        if !owned {
            info!(stack = %current.name, "Adding ownership tags to stack");
        }
        info!(
            stack = %current.name,
            current = live.len(),
            desired = routes.len(),
            "Routes changed"
        );
        let spec = self
            .generate_stack_spec(current.name.clone(), &routes)
            .await?;
        self.update_or_create(&current, spec).await
    }
}

//! Stateful in-memory doubles of the infrastructure API for reconciler tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::api::{
    ApiError, CloudFormationApi, CreateStackRequest, Ec2Api, InternetGateway, Parameter,
    RouteTable, Stack, StackPage, StackStatus, Tag, TemplateSource, UpdateStackRequest, Vpc,
};

const MUTATING: [&str; 4] = [
    "create_stack",
    "update_stack",
    "delete_stack",
    "update_termination_protection",
];

fn does_not_exist(name: &str) -> ApiError {
    ApiError::with_code(
        "ValidationError",
        format!("Stack with id {name} does not exist"),
    )
}

#[derive(Default)]
struct CloudState {
    stack: Option<Stack>,
    template_body: Option<String>,
    last_template: Option<TemplateSource>,
    last_parameters: Vec<Parameter>,
    calls: Vec<&'static str>,

    hidden_from_listing: bool,
    paginated: bool,
    hold_in_progress: bool,
    settle_as: Option<StackStatus>,
    pending_polls: u32,
    settle_to: Option<StackStatus>,
    fail_update: Option<ApiError>,
    fail_delete: Option<ApiError>,
}

/// A single-stack CloudFormation account.
#[derive(Default)]
pub struct FakeCloudFormation {
    state: Mutex<CloudState>,
}

impl FakeCloudFormation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack(name: &str, status: StackStatus, tags: Vec<Tag>, template: String) -> Self {
        let fake = Self::new();
        {
            let mut state = fake.state.lock();
            state.stack = Some(Stack {
                name: name.to_string(),
                status,
                status_reason: None,
                tags,
                termination_protection: false,
            });
            state.template_body = Some(template);
        }
        fake
    }

    pub fn protected(self) -> Self {
        if let Some(stack) = self.state.lock().stack.as_mut() {
            stack.termination_protection = true;
        }
        self
    }

    /// The stack is only visible when described by name.
    pub fn hidden_from_listing(self) -> Self {
        self.state.lock().hidden_from_listing = true;
        self
    }

    /// Listing returns an unrelated stack first and the real one on page two.
    pub fn paginated(self) -> Self {
        self.state.lock().paginated = true;
        self
    }

    /// Submitted operations never leave their `*_IN_PROGRESS` status.
    pub fn hold_in_progress(self) -> Self {
        self.state.lock().hold_in_progress = true;
        self
    }

    /// Submitted operations end in `status` instead of their success status.
    pub fn settle_as(self, status: StackStatus) -> Self {
        self.state.lock().settle_as = Some(status);
        self
    }

    /// The current status is reported `polls` more times before `status`.
    pub fn pending_polls(self, polls: u32, status: StackStatus) -> Self {
        {
            let mut state = self.state.lock();
            state.pending_polls = polls;
            state.settle_to = Some(status);
        }
        self
    }

    pub fn fail_update(self, err: ApiError) -> Self {
        self.state.lock().fail_update = Some(err);
        self
    }

    pub fn fail_delete(self, err: ApiError) -> Self {
        self.state.lock().fail_delete = Some(err);
        self
    }

    pub fn stack(&self) -> Option<Stack> {
        self.state.lock().stack.clone()
    }

    pub fn template_body(&self) -> Option<String> {
        self.state.lock().template_body.clone()
    }

    pub fn last_template(&self) -> Option<TemplateSource> {
        self.state.lock().last_template.clone()
    }

    pub fn last_parameters(&self) -> Vec<Parameter> {
        self.state.lock().last_parameters.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    pub fn mutating_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| MUTATING.contains(*c))
            .count()
    }
}

impl CloudState {
    fn apply(&mut self, name: &str, in_progress: StackStatus, complete: StackStatus, tags: Vec<Tag>) {
        let status = if self.hold_in_progress {
            in_progress
        } else {
            self.settle_as.clone().unwrap_or(complete)
        };
        let termination_protection = self
            .stack
            .as_ref()
            .map(|s| s.termination_protection)
            .unwrap_or(false);
        self.stack = Some(Stack {
            name: name.to_string(),
            status,
            status_reason: None,
            tags,
            termination_protection,
        });
    }

    fn record_template(&mut self, template: TemplateSource, parameters: Vec<Parameter>) {
        if let TemplateSource::Body(body) = &template {
            self.template_body = Some(body.clone());
        }
        self.last_template = Some(template);
        self.last_parameters = parameters;
    }
}

#[async_trait]
impl CloudFormationApi for FakeCloudFormation {
    async fn describe_stack(&self, name: &str) -> Result<Stack, ApiError> {
        let mut state = self.state.lock();
        state.calls.push("describe_stack");

        if state.pending_polls > 0 {
            state.pending_polls -= 1;
        } else if let Some(status) = state.settle_to.take() {
            if let Some(stack) = state.stack.as_mut() {
                stack.status = status;
            }
        }

        match &state.stack {
            Some(stack) if stack.name == name => Ok(stack.clone()),
            _ => Err(does_not_exist(name)),
        }
    }

    async fn describe_stacks_page(
        &self,
        next_token: Option<String>,
    ) -> Result<StackPage, ApiError> {
        let mut state = self.state.lock();
        state.calls.push("describe_stacks_page");

        if state.paginated && next_token.is_none() {
            return Ok(StackPage {
                stacks: vec![Stack {
                    name: "unrelated".to_string(),
                    status: StackStatus::CreateComplete,
                    status_reason: None,
                    tags: vec![Tag::new("kubernetes:application", "someone-else")],
                    termination_protection: false,
                }],
                next_token: Some("page-2".to_string()),
            });
        }

        let stacks = match &state.stack {
            Some(stack) if !state.hidden_from_listing => vec![stack.clone()],
            _ => vec![],
        };
        Ok(StackPage {
            stacks,
            next_token: None,
        })
    }

    async fn get_template(&self, name: &str) -> Result<String, ApiError> {
        let mut state = self.state.lock();
        state.calls.push("get_template");
        match (&state.stack, &state.template_body) {
            (Some(stack), Some(body)) if stack.name == name => Ok(body.clone()),
            _ => Err(does_not_exist(name)),
        }
    }

    async fn create_stack(&self, request: CreateStackRequest) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push("create_stack");

        if state.stack.as_ref().is_some_and(|s| s.name == request.name) {
            return Err(ApiError::with_code(
                "AlreadyExistsException",
                format!("Stack [{}] already exists", request.name),
            ));
        }

        state.record_template(request.template, request.parameters);
        state.apply(
            &request.name,
            StackStatus::CreateInProgress,
            StackStatus::CreateComplete,
            request.tags,
        );
        if let Some(stack) = state.stack.as_mut() {
            stack.termination_protection = request.termination_protection;
        }
        Ok(())
    }

    async fn update_stack(&self, request: UpdateStackRequest) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push("update_stack");

        if let Some(err) = state.fail_update.clone() {
            if err.is_does_not_exist() {
                state.stack = None;
            }
            return Err(err);
        }
        if !state.stack.as_ref().is_some_and(|s| s.name == request.name) {
            return Err(does_not_exist(&request.name));
        }

        state.record_template(request.template, request.parameters);
        state.apply(
            &request.name,
            StackStatus::UpdateInProgress,
            StackStatus::UpdateComplete,
            request.tags,
        );
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push("delete_stack");

        if let Some(err) = state.fail_delete.clone() {
            return Err(err);
        }
        if !state.stack.as_ref().is_some_and(|s| s.name == name) {
            return Err(does_not_exist(name));
        }

        if state.hold_in_progress {
            if let Some(stack) = state.stack.as_mut() {
                stack.status = StackStatus::DeleteInProgress;
            }
        } else {
            state.stack = None;
            state.template_body = None;
        }
        Ok(())
    }

    async fn update_termination_protection(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push("update_termination_protection");
        match state.stack.as_mut() {
            Some(stack) if stack.name == name => {
                stack.termination_protection = enabled;
                Ok(())
            }
            _ => Err(does_not_exist(name)),
        }
    }
}

/// A default VPC with one internet gateway and configurable route tables.
pub struct FakeEc2 {
    vpcs: Vec<Vpc>,
    internet_gateways: Vec<InternetGateway>,
    route_tables: Vec<RouteTable>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeEc2 {
    pub fn with_route_tables(route_tables: Vec<RouteTable>) -> Self {
        Self {
            vpcs: vec![Vpc {
                id: "vpc-1111".to_string(),
                is_default: true,
            }],
            internet_gateways: vec![InternetGateway {
                id: "igw-1111".to_string(),
            }],
            route_tables,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn single_zone() -> Self {
        Self::with_route_tables(vec![RouteTable {
            id: "rtb-1111".to_string(),
            tags: vec![Tag::new("AvailabilityZone", "eu-central-1a")],
        }])
    }

    /// Replaces the account's VPCs.
    pub fn with_vpcs(mut self, vpcs: Vec<Vpc>) -> Self {
        self.vpcs = vpcs;
        self
    }

    pub fn without_internet_gateway(mut self) -> Self {
        self.internet_gateways.clear();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }
}

#[async_trait]
impl Ec2Api for FakeEc2 {
    async fn describe_vpcs(&self) -> Result<Vec<Vpc>, ApiError> {
        self.calls.lock().push("describe_vpcs");
        Ok(self.vpcs.clone())
    }

    async fn describe_internet_gateways(
        &self,
        _vpc_id: &str,
    ) -> Result<Vec<InternetGateway>, ApiError> {
        self.calls.lock().push("describe_internet_gateways");
        Ok(self.internet_gateways.clone())
    }

    async fn describe_route_tables(
        &self,
        _vpc_id: &str,
        _tag_key: &str,
        _tag_value: &str,
    ) -> Result<Vec<RouteTable>, ApiError> {
        self.calls.lock().push("describe_route_tables");
        Ok(self.route_tables.clone())
    }
}

//! Infrastructure API boundary
//!
//! The reconciler only talks to the cloud through these traits, which keeps
//! it testable against fakes and independent of a particular SDK.

use std::fmt;

use async_trait::async_trait;

/// Error returned by an infrastructure API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// The target stack (or other resource) is absent.
    pub fn is_does_not_exist(&self) -> bool {
        self.message.contains("does not exist")
    }

    /// A stack with the requested name is already present.
    pub fn is_already_exists(&self) -> bool {
        self.code.as_deref() == Some("AlreadyExistsException")
            || self.message.contains("already exists")
    }

    /// An update was submitted that would not change anything.
    pub fn is_no_updates(&self) -> bool {
        self.message.contains("No updates are to be performed")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

/// Status of a stack as reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
    UpdateRollbackFailed,
    ReviewInProgress,
    /// Any status this controller does not know about.
    Other(String),
}

impl StackStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "CREATE_IN_PROGRESS" => Self::CreateInProgress,
            "CREATE_COMPLETE" => Self::CreateComplete,
            "CREATE_FAILED" => Self::CreateFailed,
            "ROLLBACK_IN_PROGRESS" => Self::RollbackInProgress,
            "ROLLBACK_COMPLETE" => Self::RollbackComplete,
            "ROLLBACK_FAILED" => Self::RollbackFailed,
            "DELETE_IN_PROGRESS" => Self::DeleteInProgress,
            "DELETE_COMPLETE" => Self::DeleteComplete,
            "DELETE_FAILED" => Self::DeleteFailed,
            "UPDATE_IN_PROGRESS" => Self::UpdateInProgress,
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS" => Self::UpdateCompleteCleanupInProgress,
            "UPDATE_COMPLETE" => Self::UpdateComplete,
            "UPDATE_FAILED" => Self::UpdateFailed,
            "UPDATE_ROLLBACK_IN_PROGRESS" => Self::UpdateRollbackInProgress,
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS" => {
                Self::UpdateRollbackCompleteCleanupInProgress
            }
            "UPDATE_ROLLBACK_COMPLETE" => Self::UpdateRollbackComplete,
            "UPDATE_ROLLBACK_FAILED" => Self::UpdateRollbackFailed,
            "REVIEW_IN_PROGRESS" => Self::ReviewInProgress,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::CreateFailed => "CREATE_FAILED",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            Self::UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            Self::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
            Self::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            Self::ReviewInProgress => "REVIEW_IN_PROGRESS",
            Self::Other(status) => status,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.as_str().ends_with("_IN_PROGRESS")
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub tags: Vec<Tag>,
    pub termination_protection: bool,
}

/// One page of a stack listing.
#[derive(Debug, Clone, Default)]
pub struct StackPage {
    pub stacks: Vec<Stack>,
    pub next_token: Option<String>,
}

/// Where the stack template is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Body(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStackRequest {
    pub name: String,
    pub template: TemplateSource,
    pub parameters: Vec<Parameter>,
    pub tags: Vec<Tag>,
    pub termination_protection: bool,
    pub timeout_in_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStackRequest {
    pub name: String,
    pub template: TemplateSource,
    pub parameters: Vec<Parameter>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vpc {
    pub id: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternetGateway {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    pub id: String,
    pub tags: Vec<Tag>,
}

impl RouteTable {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// Stack operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudFormationApi: Send + Sync {
    /// Describe a single stack by name or id.
    async fn describe_stack(&self, name: &str) -> Result<Stack, ApiError>;

    /// Describe one page of all stacks in the account.
    async fn describe_stacks_page(&self, next_token: Option<String>)
        -> Result<StackPage, ApiError>;

    /// Fetch the template body currently applied to a stack.
    async fn get_template(&self, name: &str) -> Result<String, ApiError>;

    async fn create_stack(&self, request: CreateStackRequest) -> Result<(), ApiError>;

    async fn update_stack(&self, request: UpdateStackRequest) -> Result<(), ApiError>;

    async fn delete_stack(&self, name: &str) -> Result<(), ApiError>;

    async fn update_termination_protection(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(), ApiError>;
}

/// Network topology lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_vpcs(&self) -> Result<Vec<Vpc>, ApiError>;

    /// Internet gateways attached to `vpc_id`.
    async fn describe_internet_gateways(
        &self,
        vpc_id: &str,
    ) -> Result<Vec<InternetGateway>, ApiError>;

    /// Route tables of `vpc_id` carrying the tag `tag_key=tag_value`.
    async fn describe_route_tables(
        &self,
        vpc_id: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<RouteTable>, ApiError>;
}

/// Object storage for templates too large to pass inline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateUploader: Send + Sync {
    /// Stores `body` under `bucket/key` and returns a URL the stack service can read.
    async fn upload(&self, bucket: &str, key: &str, body: String) -> Result<String, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_known_values() {
        for status in [
            "CREATE_COMPLETE",
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
            "DELETE_FAILED",
            "REVIEW_IN_PROGRESS",
        ] {
            assert_eq!(StackStatus::parse(status).as_str(), status);
        }
    }

    #[test]
    fn test_status_unknown_value_is_preserved() {
        let status = StackStatus::parse("IMPORT_IN_PROGRESS");
        assert_eq!(status, StackStatus::Other("IMPORT_IN_PROGRESS".to_string()));
        assert!(status.is_in_progress());
    }

    #[test]
    fn test_api_error_classification() {
        let err = ApiError::with_code("ValidationError", "Stack with id foo does not exist");
        assert!(err.is_does_not_exist());
        assert!(!err.is_already_exists());
        assert_eq!(
            err.to_string(),
            "ValidationError: Stack with id foo does not exist"
        );

        let err = ApiError::with_code("AlreadyExistsException", "Stack [foo] already exists");
        assert!(err.is_already_exists());

        let err = ApiError::new("No updates are to be performed.");
        assert!(err.is_no_updates());
        assert_eq!(err.to_string(), "No updates are to be performed.");
    }

    #[test]
    fn test_route_table_tag_lookup() {
        let table = RouteTable {
            id: "rtb-1".to_string(),
            tags: vec![Tag::new("AvailabilityZone", "eu-central-1a")],
        };
        assert_eq!(table.tag("AvailabilityZone"), Some("eu-central-1a"));
        assert_eq!(table.tag("Name"), None);
    }
}

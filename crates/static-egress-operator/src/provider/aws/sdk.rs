//! Infrastructure API implemented over the official AWS SDK.
//!
//! Credentials and region come from the standard provider chain
//! (environment, profile, web identity, instance metadata).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_cloudformation::types as cf;
use aws_sdk_ec2::types as ec2;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, instrument};

use super::api::{
    ApiError, CloudFormationApi, CreateStackRequest, Ec2Api, InternetGateway, Parameter,
    RouteTable, Stack, StackPage, StackStatus, Tag, TemplateSource, TemplateUploader,
    UpdateStackRequest, Vpc,
};

fn api_error<E>(err: E) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    match err.code() {
        Some(code) => ApiError::with_code(code, message),
        None => ApiError::new(message),
    }
}

/// SDK clients sharing one loaded configuration.
pub struct AwsClients {
    pub cloudformation: SdkCloudFormation,
    pub ec2: SdkEc2,
    pub s3: S3TemplateUploader,
}

impl AwsClients {
    pub async fn load() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        debug!(region = ?config.region(), "Loaded AWS configuration");
        Self {
            cloudformation: SdkCloudFormation {
                client: aws_sdk_cloudformation::Client::new(&config),
            },
            ec2: SdkEc2 {
                client: aws_sdk_ec2::Client::new(&config),
            },
            s3: S3TemplateUploader {
                client: aws_sdk_s3::Client::new(&config),
            },
        }
    }
}

pub struct SdkCloudFormation {
    client: aws_sdk_cloudformation::Client,
}

fn stack_from_sdk(stack: &cf::Stack) -> Stack {
    Stack {
        name: stack.stack_name().to_string(),
        status: StackStatus::parse(stack.stack_status().as_str()),
        status_reason: stack.stack_status_reason().map(str::to_string),
        tags: stack
            .tags()
            .iter()
            .map(|t| Tag::new(t.key(), t.value()))
            .collect(),
        termination_protection: stack.enable_termination_protection().unwrap_or(false),
    }
}

fn sdk_parameters(parameters: Vec<Parameter>) -> Vec<cf::Parameter> {
    parameters
        .into_iter()
        .map(|p| {
            cf::Parameter::builder()
                .parameter_key(p.key)
                .parameter_value(p.value)
                .build()
        })
        .collect()
}

fn sdk_tags(tags: Vec<Tag>) -> Result<Vec<cf::Tag>, ApiError> {
    tags.into_iter()
        .map(|t| {
            cf::Tag::builder()
                .key(t.key)
                .value(t.value)
                .build()
                .map_err(|e| ApiError::new(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl CloudFormationApi for SdkCloudFormation {
    #[instrument(skip(self))]
    async fn describe_stack(&self, name: &str) -> Result<Stack, ApiError> {
        let output = self
            .client
            .describe_stacks()
            .stack_name(name)
            .send()
            .await
            .map_err(api_error)?;

        output
            .stacks()
            .first()
            .map(stack_from_sdk)
            .ok_or_else(|| ApiError::new(format!("Stack with id {name} does not exist")))
    }

    async fn describe_stacks_page(
        &self,
        next_token: Option<String>,
    ) -> Result<StackPage, ApiError> {
        let output = self
            .client
            .describe_stacks()
            .set_next_token(next_token)
            .send()
            .await
            .map_err(api_error)?;

        Ok(StackPage {
            stacks: output.stacks().iter().map(stack_from_sdk).collect(),
            next_token: output.next_token().map(str::to_string),
        })
    }

    #[instrument(skip(self))]
    async fn get_template(&self, name: &str) -> Result<String, ApiError> {
        let output = self
            .client
            .get_template()
            .stack_name(name)
            .send()
            .await
            .map_err(api_error)?;

        output
            .template_body()
            .map(str::to_string)
            .ok_or_else(|| ApiError::new(format!("Stack {name} has no template body")))
    }

    #[instrument(skip_all, fields(stack = %request.name))]
    async fn create_stack(&self, request: CreateStackRequest) -> Result<(), ApiError> {
        let (body, url) = match request.template {
            TemplateSource::Body(body) => (Some(body), None),
            TemplateSource::Url(url) => (None, Some(url)),
        };

        self.client
            .create_stack()
            .stack_name(request.name)
            .set_template_body(body)
            .set_template_url(url)
            .set_parameters(Some(sdk_parameters(request.parameters)))
            .set_tags(Some(sdk_tags(request.tags)?))
            .enable_termination_protection(request.termination_protection)
            .timeout_in_minutes(i32::try_from(request.timeout_in_minutes).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    #[instrument(skip_all, fields(stack = %request.name))]
    async fn update_stack(&self, request: UpdateStackRequest) -> Result<(), ApiError> {
        let (body, url) = match request.template {
            TemplateSource::Body(body) => (Some(body), None),
            TemplateSource::Url(url) => (None, Some(url)),
        };

        self.client
            .update_stack()
            .stack_name(request.name)
            .set_template_body(body)
            .set_template_url(url)
            .set_parameters(Some(sdk_parameters(request.parameters)))
            .set_tags(Some(sdk_tags(request.tags)?))
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_stack(&self, name: &str) -> Result<(), ApiError> {
        self.client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_termination_protection(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(), ApiError> {
        self.client
            .update_termination_protection()
            .stack_name(name)
            .enable_termination_protection(enabled)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }
}

pub struct SdkEc2 {
    client: aws_sdk_ec2::Client,
}

fn filter(name: &str, value: &str) -> ec2::Filter {
    ec2::Filter::builder().name(name).values(value).build()
}

#[async_trait]
impl Ec2Api for SdkEc2 {
    async fn describe_vpcs(&self) -> Result<Vec<Vpc>, ApiError> {
        let output = self
            .client
            .describe_vpcs()
            .send()
            .await
            .map_err(api_error)?;

        Ok(output
            .vpcs()
            .iter()
            .filter_map(|vpc| {
                Some(Vpc {
                    id: vpc.vpc_id()?.to_string(),
                    is_default: vpc.is_default().unwrap_or(false),
                })
            })
            .collect())
    }

    async fn describe_internet_gateways(
        &self,
        vpc_id: &str,
    ) -> Result<Vec<InternetGateway>, ApiError> {
        let output = self
            .client
            .describe_internet_gateways()
            .filters(filter("attachment.vpc-id", vpc_id))
            .send()
            .await
            .map_err(api_error)?;

        Ok(output
            .internet_gateways()
            .iter()
            .filter_map(|igw| {
                Some(InternetGateway {
                    id: igw.internet_gateway_id()?.to_string(),
                })
            })
            .collect())
    }

    async fn describe_route_tables(
        &self,
        vpc_id: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<RouteTable>, ApiError> {
        let output = self
            .client
            .describe_route_tables()
            .filters(filter("vpc-id", vpc_id))
            .filters(filter(&format!("tag:{tag_key}"), tag_value))
            .send()
            .await
            .map_err(api_error)?;

        Ok(output
            .route_tables()
            .iter()
            .filter_map(|table| {
                Some(RouteTable {
                    id: table.route_table_id()?.to_string(),
                    tags: table
                        .tags()
                        .iter()
                        .filter_map(|t| Some(Tag::new(t.key()?, t.value()?)))
                        .collect(),
                })
            })
            .collect())
    }
}

pub struct S3TemplateUploader {
    client: aws_sdk_s3::Client,
}

#[async_trait]
impl TemplateUploader for S3TemplateUploader {
    #[instrument(skip(self, body))]
    async fn upload(&self, bucket: &str, key: &str, body: String) -> Result<String, ApiError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await
            .map_err(api_error)?;

        Ok(format!("https://{bucket}.s3.amazonaws.com/{key}"))
    }
}

//! AWS implementation of [`CloudApi`]
//!
//! Networks are VPCs, gateways and routes go through EC2, the shared task
//! execution role through IAM and clusters through ECS. Transient failures
//! are retried by the SDK according to the [`RetryConfig`] given at connect
//! time.

use crate::error::{AwsError, Result};
use async_trait::async_trait;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification};
use envflow_cloud::{CloudApi, Ipv4Block, RetryConfig};

const MANAGED_BY_TAG: &str = "ManagedBy";
const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// Managed policy granting ECS tasks image pulls and log delivery
const EXECUTION_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";

const ECS_TASKS_TRUST_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Principal": { "Service": "ecs-tasks.amazonaws.com" },
      "Action": "sts:AssumeRole"
    }
  ]
}"#;

fn api_error<E: std::error::Error>(operation: &'static str) -> impl FnOnce(E) -> AwsError {
    move |err| AwsError::Api {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

fn name_tags(resource_type: ResourceType, name: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key("Name").value(name).build())
        .tags(Tag::builder().key(MANAGED_BY_TAG).value("envflow").build())
        .build()
}

fn parse_block(vpc_id: Option<&str>, cidr: &str) -> Result<Ipv4Block> {
    cidr.parse().map_err(|_| AwsError::InvalidCidr {
        vpc_id: vpc_id.unwrap_or("unknown").to_string(),
        cidr: cidr.to_string(),
    })
}

/// AWS cloud API client
pub struct AwsCloud {
    ec2: aws_sdk_ec2::Client,
    iam: aws_sdk_iam::Client,
    ecs: aws_sdk_ecs::Client,
}

impl AwsCloud {
    /// Load credentials from the environment and connect to `region`
    pub async fn connect(region: impl Into<String>, retry: &RetryConfig) -> Self {
        let retry_config = aws_config::retry::RetryConfig::standard()
            .with_max_attempts(retry.max_attempts)
            .with_initial_backoff(retry.initial_delay)
            .with_max_backoff(retry.max_delay);

        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .retry_config(retry_config)
            .load()
            .await;

        Self::from_config(&shared)
    }

    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            ec2: aws_sdk_ec2::Client::new(config),
            iam: aws_sdk_iam::Client::new(config),
            ecs: aws_sdk_ecs::Client::new(config),
        }
    }
}

#[async_trait]
impl CloudApi for AwsCloud {
    fn name(&self) -> &str {
        "aws"
    }

    async fn network_blocks(&self) -> envflow_cloud::Result<Vec<Ipv4Block>> {
        let out = self
            .ec2
            .describe_vpcs()
            .send()
            .await
            .map_err(api_error("DescribeVpcs"))?;

        let mut blocks = Vec::new();
        for vpc in out.vpcs() {
            if let Some(cidr) = vpc.cidr_block() {
                blocks.push(parse_block(vpc.vpc_id(), cidr)?);
            }
            // Secondary blocks count as used address space too
            for association in vpc.cidr_block_association_set() {
                if let Some(cidr) = association.cidr_block() {
                    blocks.push(parse_block(vpc.vpc_id(), cidr)?);
                }
            }
        }
        blocks.sort();
        blocks.dedup();

        tracing::debug!(count = blocks.len(), "Described existing VPC blocks");
        Ok(blocks)
    }

    async fn create_network(&self, name: &str, block: Ipv4Block) -> envflow_cloud::Result<String> {
        let out = self
            .ec2
            .create_vpc()
            .cidr_block(block.to_string())
            .tag_specifications(name_tags(ResourceType::Vpc, name))
            .send()
            .await
            .map_err(api_error("CreateVpc"))?;

        let vpc_id = out
            .vpc()
            .and_then(|v| v.vpc_id())
            .ok_or(AwsError::MissingField {
                operation: "CreateVpc",
                field: "VpcId",
            })?;

        tracing::info!(vpc_id, %block, "Created VPC");
        Ok(vpc_id.to_string())
    }

    async fn create_internet_gateway(&self, name: &str) -> envflow_cloud::Result<String> {
        let out = self
            .ec2
            .create_internet_gateway()
            .tag_specifications(name_tags(ResourceType::InternetGateway, name))
            .send()
            .await
            .map_err(api_error("CreateInternetGateway"))?;

        let gateway_id = out
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .ok_or(AwsError::MissingField {
                operation: "CreateInternetGateway",
                field: "InternetGatewayId",
            })?;

        tracing::info!(gateway_id, "Created internet gateway");
        Ok(gateway_id.to_string())
    }

    async fn attach_internet_gateway(
        &self,
        gateway_id: &str,
        network_id: &str,
    ) -> envflow_cloud::Result<()> {
        self.ec2
            .attach_internet_gateway()
            .internet_gateway_id(gateway_id)
            .vpc_id(network_id)
            .send()
            .await
            .map_err(api_error("AttachInternetGateway"))?;

        tracing::info!(gateway_id, vpc_id = network_id, "Attached internet gateway");
        Ok(())
    }

    async fn create_default_route(
        &self,
        network_id: &str,
        gateway_id: &str,
    ) -> envflow_cloud::Result<String> {
        let out = self
            .ec2
            .describe_route_tables()
            .filters(Filter::builder().name("vpc-id").values(network_id).build())
            .filters(
                Filter::builder()
                    .name("association.main")
                    .values("true")
                    .build(),
            )
            .send()
            .await
            .map_err(api_error("DescribeRouteTables"))?;

        let route_table_id = out
            .route_tables()
            .first()
            .and_then(|t| t.route_table_id())
            .ok_or_else(|| AwsError::NoMainRouteTable(network_id.to_string()))?
            .to_string();

        self.ec2
            .create_route()
            .route_table_id(&route_table_id)
            .destination_cidr_block(DEFAULT_ROUTE)
            .gateway_id(gateway_id)
            .send()
            .await
            .map_err(api_error("CreateRoute"))?;

        tracing::info!(route_table_id, gateway_id, "Created default route");
        Ok(route_table_id)
    }

    async fn create_subnet(
        &self,
        name: &str,
        network_id: &str,
        block: Ipv4Block,
    ) -> envflow_cloud::Result<String> {
        let out = self
            .ec2
            .create_subnet()
            .vpc_id(network_id)
            .cidr_block(block.to_string())
            .tag_specifications(name_tags(ResourceType::Subnet, name))
            .send()
            .await
            .map_err(api_error("CreateSubnet"))?;

        let subnet_id = out
            .subnet()
            .and_then(|s| s.subnet_id())
            .ok_or(AwsError::MissingField {
                operation: "CreateSubnet",
                field: "SubnetId",
            })?;

        tracing::info!(subnet_id, %block, "Created subnet");
        Ok(subnet_id.to_string())
    }

    async fn ensure_execution_role(&self, role_name: &str) -> envflow_cloud::Result<String> {
        let created = self
            .iam
            .create_role()
            .role_name(role_name)
            .assume_role_policy_document(ECS_TASKS_TRUST_POLICY)
            .send()
            .await;

        match created {
            Ok(_) => tracing::info!(role_name, "Created task execution role"),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_entity_already_exists_exception()) =>
            {
                tracing::debug!(role_name, "Task execution role already exists");
            }
            Err(err) => return Err(api_error("CreateRole")(err).into()),
        }

        // Attaching an already attached policy is a no-op
        self.iam
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(EXECUTION_POLICY_ARN)
            .send()
            .await
            .map_err(api_error("AttachRolePolicy"))?;

        Ok(role_name.to_string())
    }

    async fn create_cluster(&self, name: &str) -> envflow_cloud::Result<String> {
        let out = self
            .ecs
            .create_cluster()
            .cluster_name(name)
            .send()
            .await
            .map_err(api_error("CreateCluster"))?;

        let cluster_arn = out
            .cluster()
            .and_then(|c| c.cluster_arn())
            .ok_or(AwsError::MissingField {
                operation: "CreateCluster",
                field: "ClusterArn",
            })?;

        tracing::info!(cluster_arn, "Created cluster");
        Ok(cluster_arn.to_string())
    }
}

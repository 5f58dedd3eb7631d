//! Environment state machine
//!
//! Creation walks [`Step::ALL`] in order. Each step reads the resources the
//! previous steps produced, creates one cloud resource, and the updated
//! record is persisted before the progress event goes out. A failing step
//! halts the sequence; what was already created stays recorded on the
//! environment and is cleaned up by a later destroy.
//!
//! After the last step the environment document is applied with import
//! bindings for every created resource. From then on the provisioning tool's
//! state in the environment's working directory owns them.
//!
//! Destruction hands the whole environment document to the provisioning tool,
//! which owns teardown ordering. A partly created environment is adopted
//! first so the tool knows what to destroy. The record is removed only after
//! the tool reports success.

use crate::apps;
use crate::controlplane::{Context, cancellable, remove_work_dir};
use crate::domain::validate_domain_name;
use crate::error::{ControlPlaneError, Result};
use crate::progress::ProgressSender;
use envflow_cloud::{
    CloudApi, CloudError, Domain, Environment, EnvironmentStatus, Ipv4Block, LoadBalancerKind,
    RecordKind, Resources,
};
use envflow_terraform::{LOAD_BALANCER_OUTPUT, output_string};
use std::fmt;
use std::ops::RangeInclusive;
use tokio_util::sync::CancellationToken;

/// Task execution role shared by every environment
pub const EXECUTION_ROLE_NAME: &str = "envflow-task-execution";

/// Extra prefix bits of a compute subnet: each subnet is 1/16th of the network
pub const SUBNET_EXTRA_BITS: u8 = 4;

/// Index of the compute subnet inside the environment network
pub const COMPUTE_SUBNET_INDEX: u32 = 1;

/// Usable environment network prefixes. AWS accepts /16 to /28 for both VPCs
/// and subnets, and the compute subnet is [`SUBNET_EXTRA_BITS`] longer than
/// its network.
pub const ENVIRONMENT_PREFIXES: RangeInclusive<u8> = 16..=(28 - SUBNET_EXTRA_BITS);

const MAX_NAME_LEN: usize = 32;

const ADOPT_STEP: &str = "hand resources to terraform";

/// Parameters of an environment creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateEnvironment {
    pub name: String,
    pub domain: Option<String>,
    pub load_balancer: Option<LoadBalancerKind>,
}

impl CreateEnvironment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            load_balancer: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>, load_balancer: LoadBalancerKind) -> Self {
        self.domain = Some(domain.into());
        self.load_balancer = Some(load_balancer);
        self
    }

    /// Checks that need no I/O
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        match (&self.domain, self.load_balancer) {
            (Some(domain), Some(_)) => validate_domain_name(domain),
            (Some(_), None) => Err(ControlPlaneError::Validation(
                "a load balancer is required when a domain is set".to_string(),
            )),
            (None, Some(_)) => Err(ControlPlaneError::Validation(
                "a load balancer can only be set together with a domain".to_string(),
            )),
            (None, None) => Ok(()),
        }
    }
}

/// Environment names: 1-32 of `[a-z0-9-]`, no leading or trailing `-`
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(ControlPlaneError::Validation(format!(
            "invalid environment name '{}': {}",
            name, reason
        )))
    };

    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return invalid("must be 1 to 32 characters long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return invalid("only lowercase letters, digits and '-' are allowed");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return invalid("must not start or end with '-'");
    }
    Ok(())
}

/// One creation step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Vpc,
    InternetGateway,
    Route,
    Subnet,
    ExecutionRole,
    Cluster,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::Vpc,
        Step::InternetGateway,
        Step::Route,
        Step::Subnet,
        Step::ExecutionRole,
        Step::Cluster,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Vpc => "create VPC",
            Step::InternetGateway => "create internet gateway",
            Step::Route => "create default route",
            Step::Subnet => "create subnet",
            Step::ExecutionRole => "create execution role",
            Step::Cluster => "create cluster",
        }
    }

    /// Create this step's resource.
    ///
    /// Returns the environment's resources with this step's field filled in
    /// and the progress message to report.
    pub async fn run(
        self,
        cloud: &dyn CloudApi,
        env: &Environment,
    ) -> envflow_cloud::Result<(Resources, String)> {
        let current = &env.resources;
        let mut next = current.clone();

        let message = match self {
            Step::Vpc => {
                let block = network_block(env)?;
                let vpc_id = cloud.create_network(&env.name, block).await?;
                let message = format!("Created VPC {} ({})", vpc_id, block);
                next.vpc_id = Some(vpc_id);
                message
            }
            Step::InternetGateway => {
                let vpc_id = require(&current.vpc_id, "VPC")?;
                let gateway_id = cloud.create_internet_gateway(&env.name).await?;
                cloud.attach_internet_gateway(&gateway_id, vpc_id).await?;
                let message = format!(
                    "Created internet gateway {} and attached it to {}",
                    gateway_id, vpc_id
                );
                next.internet_gateway_id = Some(gateway_id);
                message
            }
            Step::Route => {
                let vpc_id = require(&current.vpc_id, "VPC")?;
                let gateway_id = require(&current.internet_gateway_id, "internet gateway")?;
                let route_table_id = cloud.create_default_route(vpc_id, gateway_id).await?;
                let message = format!(
                    "Created default route in {} via {}",
                    route_table_id, gateway_id
                );
                next.route_table_id = Some(route_table_id);
                message
            }
            Step::Subnet => {
                let vpc_id = require(&current.vpc_id, "VPC")?;
                let block = compute_subnet(network_block(env)?)?;
                let subnet_id = cloud.create_subnet(&env.name, vpc_id, block).await?;
                let message = format!("Created subnet {} ({})", subnet_id, block);
                next.subnet_id = Some(subnet_id);
                message
            }
            Step::ExecutionRole => {
                let role = cloud.ensure_execution_role(EXECUTION_ROLE_NAME).await?;
                let message = format!("Execution role {} is ready", role);
                next.execution_role_name = Some(role);
                message
            }
            Step::Cluster => {
                let cluster_id = cloud.create_cluster(&env.name).await?;
                let message = format!("Created cluster {}", cluster_id);
                next.cluster_id = Some(cluster_id);
                message
            }
        };

        Ok((next, message))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The compute subnet carved out of an environment network
pub fn compute_subnet(network: Ipv4Block) -> envflow_cloud::Result<Ipv4Block> {
    network.subnet(network.prefix() + SUBNET_EXTRA_BITS, COMPUTE_SUBNET_INDEX)
}

fn network_block(env: &Environment) -> envflow_cloud::Result<Ipv4Block> {
    env.cidr_block.ok_or_else(|| {
        CloudError::ResourceNotFound(format!("address block of environment {}", env.name))
    })
}

fn require<'a>(field: &'a Option<String>, what: &str) -> envflow_cloud::Result<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| CloudError::ResourceNotFound(format!("{} of the environment", what)))
}

async fn persist(context: &Context, env: &Environment) -> Result<()> {
    context
        .store
        .put_record(env)
        .await
        .map_err(ControlPlaneError::Store)
}

#[tracing::instrument(skip_all, fields(environment = %request.name))]
pub(crate) async fn create(
    context: &Context,
    request: &CreateEnvironment,
    progress: &ProgressSender,
    cancel: &CancellationToken,
) -> Result<()> {
    request.validate()?;
    let _claim = context
        .claims
        .claim(RecordKind::Environment, &request.name)?;

    if context
        .store
        .record_exists::<Environment>(&request.name)
        .await
        .map_err(ControlPlaneError::Store)?
    {
        return Err(ControlPlaneError::Conflict(format!(
            "environment {} already exists",
            request.name
        )));
    }

    let mut env = Environment::new(&request.name);
    if let (Some(domain), Some(load_balancer)) = (&request.domain, request.load_balancer) {
        if !context
            .store
            .record_exists::<Domain>(domain)
            .await
            .map_err(ControlPlaneError::Store)?
        {
            return Err(ControlPlaneError::Validation(format!(
                "domain {} does not exist",
                domain
            )));
        }
        env = env.with_domain(domain, load_balancer);
    }

    // Held until the block is recorded on the stored environment
    let reservation = cancellable(
        cancel,
        "allocate network block",
        context.allocator.allocate(),
    )
    .await?;
    env.cidr_block = Some(reservation.block());
    persist(context, &env).await?;
    tracing::info!(cidr_block = %reservation.block(), "Provisioning environment");
    drop(reservation);

    for step in Step::ALL {
        tracing::debug!(step = %step, "Running step");
        let (resources, message) = cancellable(cancel, step.name(), async {
            step.run(context.cloud.as_ref(), &env)
                .await
                .map_err(|e| ControlPlaneError::step(step, e))
        })
        .await?;

        env.resources = resources;
        env.touch();
        persist(context, &env).await?;
        progress.send(message).await;
    }

    adopt(context, &mut env, progress, cancel).await?;

    env.set_status(EnvironmentStatus::Provisioned);
    persist(context, &env).await?;
    progress
        .send(format!("Environment {} is ready", env.name))
        .await;
    Ok(())
}

/// Apply the environment document with import bindings for every recorded
/// resource, then record the declared outputs and mark the environment as
/// managed by the tool
async fn adopt(
    context: &Context,
    env: &mut Environment,
    progress: &ProgressSender,
    cancel: &CancellationToken,
) -> Result<()> {
    let document = context
        .synthesizer
        .adopt_environment(env)
        .map_err(|e| ControlPlaneError::step("render environment document", e))?;

    progress
        .send(format!(
            "Applying the environment document for {} ({} existing resources)",
            env.name,
            document.imports().len()
        ))
        .await;

    let work_dir = context.settings.work_dir(RecordKind::Environment, &env.name);
    let outputs = context
        .provisioner
        .provision(&work_dir, &document, cancel)
        .await
        .map_err(|e| ControlPlaneError::terraform(ADOPT_STEP, e))?;

    let vpc_id =
        output_string(&outputs, "vpc_id").map_err(|e| ControlPlaneError::step(ADOPT_STEP, e))?;
    if let Some(created) = env
        .resources
        .vpc_id
        .as_deref()
        .filter(|created| *created != vpc_id)
    {
        return Err(ControlPlaneError::step(
            ADOPT_STEP,
            CloudError::ApiError(format!(
                "terraform manages VPC {} but {} was created for the environment",
                vpc_id, created
            )),
        ));
    }

    if env.domain.is_some() {
        let dns_name = output_string(&outputs, LOAD_BALANCER_OUTPUT)
            .map_err(|e| ControlPlaneError::step(ADOPT_STEP, e))?;
        env.load_balancer_dns_name = Some(dns_name);
    }
    env.managed = true;
    env.touch();
    persist(context, env).await?;

    match &env.load_balancer_dns_name {
        Some(dns_name) => {
            progress
                .send(format!(
                    "terraform now manages environment {}, load balancer at {}",
                    env.name, dns_name
                ))
                .await
        }
        None => {
            progress
                .send(format!("terraform now manages environment {}", env.name))
                .await
        }
    }
    Ok(())
}

#[tracing::instrument(skip_all, fields(environment = %name))]
pub(crate) async fn destroy(
    context: &Context,
    name: &str,
    progress: &ProgressSender,
    cancel: &CancellationToken,
) -> Result<()> {
    validate_name(name)?;
    let _claim = context.claims.claim(RecordKind::Environment, name)?;

    let Some(mut env) = context
        .store
        .get_record::<Environment>(name)
        .await
        .map_err(ControlPlaneError::Store)?
    else {
        progress
            .send(format!("Environment {} does not exist, nothing to destroy", name))
            .await;
        return Ok(());
    };

    env.set_status(EnvironmentStatus::Destroying);
    persist(context, &env).await?;

    let work_dir = context.settings.work_dir(RecordKind::Environment, name);
    if env.resources.completed() > 0 {
        if !env.managed {
            progress
                .send(format!(
                    "terraform does not manage environment {} yet, handing its resources over first",
                    name
                ))
                .await;
            adopt(context, &mut env, progress, cancel).await?;
        }

        let document = context
            .synthesizer
            .render_environment(&env)
            .map_err(|e| ControlPlaneError::step("render environment document", e))?;

        progress
            .send(format!("Destroying resources of environment {}", name))
            .await;
        context
            .provisioner
            .teardown(&work_dir, &document, cancel)
            .await
            .map_err(|e| ControlPlaneError::terraform("destroy environment", e))?;
    }

    let removed = apps::remove_all(context, name).await?;
    if removed > 0 {
        tracing::info!(apps = removed, "Removed application rows");
    }

    context
        .store
        .delete_record::<Environment>(name)
        .await
        .map_err(ControlPlaneError::Store)?;
    remove_work_dir(&work_dir).await;

    progress
        .send(format!("Environment {} was destroyed", name))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        let longest = "x".repeat(32);
        let too_long = "x".repeat(33);
        for name in ["staging", "qa-1", "a", "0", longest.as_str()] {
            assert!(validate_name(name).is_ok(), "{}", name);
        }
        for name in ["", "-qa", "qa-", "Staging", "qa_1", "qa.1", too_long.as_str()] {
            assert!(
                matches!(validate_name(name), Err(ControlPlaneError::Validation(_))),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_load_balancer_iff_domain() {
        assert!(CreateEnvironment::new("prod").validate().is_ok());
        assert!(
            CreateEnvironment::new("prod")
                .with_domain("example.com", LoadBalancerKind::Alb)
                .validate()
                .is_ok()
        );

        let mut missing_lb = CreateEnvironment::new("prod");
        missing_lb.domain = Some("example.com".to_string());
        assert!(matches!(
            missing_lb.validate(),
            Err(ControlPlaneError::Validation(_))
        ));

        let mut missing_domain = CreateEnvironment::new("prod");
        missing_domain.load_balancer = Some(LoadBalancerKind::Alb);
        assert!(matches!(
            missing_domain.validate(),
            Err(ControlPlaneError::Validation(_))
        ));
    }

    #[test]
    fn test_compute_subnet() {
        let subnet = compute_subnet("10.3.0.0/16".parse().unwrap()).unwrap();
        assert_eq!(subnet.to_string(), "10.3.16.0/20");
    }

    #[test]
    fn test_compute_subnet_fits_every_usable_prefix() {
        for prefix in ENVIRONMENT_PREFIXES {
            let network = Ipv4Block::new("10.0.0.0".parse().unwrap(), prefix).unwrap();
            let subnet = compute_subnet(network).unwrap();
            assert!(subnet.prefix() <= 28, "/{} gives {}", prefix, subnet);
        }
    }

    #[test]
    fn test_step_order_matches_resources() {
        let names: Vec<&str> = Step::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "create VPC",
                "create internet gateway",
                "create default route",
                "create subnet",
                "create execution role",
                "create cluster",
            ]
        );
    }
}

//! Records tracked for environments, domains and per-application infrastructure

use crate::cidr::Ipv4Block;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Private network implementation backing an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkKind {
    #[default]
    AwsVpc,
}

/// Container orchestrator running an environment's applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestratorKind {
    #[default]
    Ecs,
}

/// Load balancer placed in front of applications when a domain is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerKind {
    Alb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DnsService {
    #[default]
    Route53,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateAuthority {
    #[default]
    Acm,
}

macro_rules! kebab_display {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let value = serde_json::to_value(self).map_err(|_| fmt::Error)?;
                f.write_str(value.as_str().unwrap_or_default())
            }
        }
    )*};
}

kebab_display!(
    NetworkKind,
    OrchestratorKind,
    LoadBalancerKind,
    DnsService,
    CertificateAuthority
);

/// Lifecycle of an environment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Creation steps are running, or stopped part way
    Provisioning,
    /// All creation steps finished
    Provisioned,
    /// Teardown is running
    Destroying,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentStatus::Provisioning => write!(f, "provisioning"),
            EnvironmentStatus::Provisioned => write!(f, "provisioned"),
            EnvironmentStatus::Destroying => write!(f, "destroying"),
        }
    }
}

/// Cloud resources created for an environment.
///
/// Fields are filled strictly in declaration order, one per creation step. The
/// first empty field is the step at which provisioning stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub vpc_id: Option<String>,
    pub internet_gateway_id: Option<String>,
    pub route_table_id: Option<String>,
    pub subnet_id: Option<String>,
    pub execution_role_name: Option<String>,
    pub cluster_id: Option<String>,
}

impl Resources {
    fn slots(&self) -> [&Option<String>; 6] {
        [
            &self.vpc_id,
            &self.internet_gateway_id,
            &self.route_table_id,
            &self.subnet_id,
            &self.execution_role_name,
            &self.cluster_id,
        ]
    }

    /// Number of leading fields that are populated
    pub fn completed(&self) -> usize {
        self.slots().iter().take_while(|slot| slot.is_some()).count()
    }

    /// True when no field is populated after the first empty one
    pub fn is_monotonic(&self) -> bool {
        self.slots()
            .iter()
            .skip(self.completed())
            .all(|slot| slot.is_none())
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.slots().len()
    }
}

/// An isolated, named group of applications with its own network and cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub network: NetworkKind,
    pub orchestrator: OrchestratorKind,
    pub domain: Option<String>,
    pub load_balancer: Option<LoadBalancerKind>,
    pub status: EnvironmentStatus,
    /// Address block of the environment network, set once allocated
    pub cidr_block: Option<Ipv4Block>,
    pub resources: Resources,
    /// Set once the provisioning tool's state owns `resources`; only then can
    /// the tool tear them down
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub load_balancer_dns_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            network: NetworkKind::default(),
            orchestrator: OrchestratorKind::default(),
            domain: None,
            load_balancer: None,
            status: EnvironmentStatus::Provisioning,
            cidr_block: None,
            resources: Resources::default(),
            managed: false,
            load_balancer_dns_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>, load_balancer: LoadBalancerKind) -> Self {
        self.domain = Some(domain.into());
        self.load_balancer = Some(load_balancer);
        self
    }

    pub fn set_status(&mut self, status: EnvironmentStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A DNS name owning a hosted zone and a wildcard certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub dns_service: DnsService,
    pub certificate_authority: CertificateAuthority,
    pub zone_id: Option<String>,
    pub certificate_arn: Option<String>,
    #[serde(default)]
    pub name_servers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dns_service: DnsService::default(),
            certificate_authority: CertificateAuthority::default(),
            zone_id: None,
            certificate_arn: None,
            name_servers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_provisioned(&self) -> bool {
        self.zone_id.is_some() && self.certificate_arn.is_some()
    }
}

/// Infrastructure of one application deployed into one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfra {
    pub app: String,
    pub env: String,
    pub task_definition_arn: Option<String>,
    pub target_group_arn: Option<String>,
    pub listener_rule_arn: Option<String>,
    pub dns_record: Option<String>,
    pub service_arn: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AppInfra {
    pub fn new(app: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            env: env.into(),
            task_definition_arn: None,
            target_group_arn: None,
            listener_rule_arn: None,
            dns_record: None,
            service_arn: None,
            updated_at: Utc::now(),
        }
    }

    /// Composite store key, `app@env`
    pub fn key_for(app: &str, env: &str) -> String {
        format!("{}@{}", app, env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_progress() {
        let mut resources = Resources::default();
        assert_eq!(resources.completed(), 0);
        assert!(resources.is_monotonic());

        resources.vpc_id = Some("vpc-1".to_string());
        resources.internet_gateway_id = Some("igw-1".to_string());
        assert_eq!(resources.completed(), 2);
        assert!(resources.is_monotonic());
        assert!(!resources.is_complete());

        resources.subnet_id = Some("subnet-1".to_string());
        assert_eq!(resources.completed(), 2);
        assert!(!resources.is_monotonic());
    }

    #[test]
    fn test_kind_display_matches_serde() {
        assert_eq!(NetworkKind::AwsVpc.to_string(), "aws-vpc");
        assert_eq!(LoadBalancerKind::Alb.to_string(), "alb");
        assert_eq!(DnsService::Route53.to_string(), "route53");
    }

    #[test]
    fn test_environment_roundtrip() {
        let mut env = Environment::new("staging").with_domain("example.com", LoadBalancerKind::Alb);
        env.cidr_block = Some("10.1.0.0/16".parse().unwrap());
        env.resources.vpc_id = Some("vpc-123".to_string());

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["status"], "provisioning");
        assert_eq!(json["cidr_block"], "10.1.0.0/16");
        assert_eq!(json["load_balancer"], "alb");

        let back: Environment = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_app_infra_key() {
        assert_eq!(AppInfra::key_for("api", "staging"), "api@staging");
    }
}

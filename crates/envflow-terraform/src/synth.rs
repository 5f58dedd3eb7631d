//! Terraform document synthesis
//!
//! Renders a self-contained `main.tf` for an environment or a domain: the AWS
//! provider header for the configured region, one versioned module block with
//! the per-instance bindings, and the outputs the control plane reads back
//! after `apply`.
//!
//! Rendering is pure. The same inputs always produce the same bytes.

use crate::error::{Result, TerraformError};
use envflow_cloud::{Domain, Environment};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

const HEADER_TEMPLATE: &str = include_str!("templates/header.tf");
const ENVIRONMENT_TEMPLATE: &str = include_str!("templates/environment.tf");
const DOMAIN_TEMPLATE: &str = include_str!("templates/domain.tf");

/// Outputs every environment document declares
pub const ENVIRONMENT_OUTPUTS: &[&str] = &["vpc_id", "cluster_id"];

/// Extra output declared when the environment sits behind a domain
pub const LOAD_BALANCER_OUTPUT: &str = "load_balancer_dns_name";

/// Outputs every domain document declares
pub const DOMAIN_OUTPUTS: &[&str] = &["name_servers", "zone_id", "certificate_arn"];

/// Reference to an externally maintained, versioned module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub source: String,
    pub version: String,
}

impl ModuleRef {
    pub fn new(source: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            version: version.into(),
        }
    }

    pub fn default_environment() -> Self {
        Self::new("envflow/environment/aws", "1.4.0")
    }

    pub fn default_domain() -> Self {
        Self::new("envflow/domain/aws", "1.1.0")
    }
}

/// A resource that already exists in the cloud, bound into the tool's state on
/// the next apply instead of being created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Import {
    /// Resource address inside the environment module
    pub address: String,
    pub id: String,
}

impl Import {
    fn new(address: &str, id: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            id: id.into(),
        }
    }
}

/// Bindings for every resource recorded on `env`
///
/// The execution role is shared by all environments and is passed to the
/// module by name, never imported into one environment's state.
pub fn environment_imports(env: &Environment) -> Vec<Import> {
    let resources = &env.resources;
    let mut imports = Vec::new();

    if let Some(id) = &resources.vpc_id {
        imports.push(Import::new("aws_vpc.this", id));
    }
    if let Some(id) = &resources.internet_gateway_id {
        imports.push(Import::new("aws_internet_gateway.this", id));
    }
    if let Some(id) = &resources.route_table_id {
        imports.push(Import::new("aws_route.default", format!("{}_0.0.0.0/0", id)));
    }
    if let Some(id) = &resources.subnet_id {
        imports.push(Import::new("aws_subnet.compute", id));
    }
    // ECS clusters import by name, the last segment of the ARN
    if let Some(id) = &resources.cluster_id {
        let cluster_name = id.rsplit('/').next().unwrap_or(id);
        imports.push(Import::new("aws_ecs_cluster.this", cluster_name));
    }
    imports
}

/// What a document provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Environment,
    Domain,
}

/// A rendered configuration document and the outputs it declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    kind: DocumentKind,
    text: String,
    outputs: Vec<String>,
    imports: Vec<Import>,
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Names of the outputs the caller reads after apply
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Existing resources the document binds on apply
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }
}

/// Renders environment and domain documents
pub struct Synthesizer {
    tera: Tera,
    region: String,
    environment_module: ModuleRef,
    domain_module: ModuleRef,
}

impl Synthesizer {
    pub fn new(
        region: impl Into<String>,
        environment_module: ModuleRef,
        domain_module: ModuleRef,
    ) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("header.tf", HEADER_TEMPLATE),
            ("environment.tf", ENVIRONMENT_TEMPLATE),
            ("domain.tf", DOMAIN_TEMPLATE),
        ])?;

        Ok(Self {
            tera,
            region: region.into(),
            environment_module,
            domain_module,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn base_context(&self, module: &ModuleRef, name: &str, outputs: &[String]) -> Context {
        let mut context = Context::new();
        context.insert("region", &self.region);
        context.insert("module_source", &module.source);
        context.insert("module_version", &module.version);
        context.insert("name", name);
        context.insert("outputs", outputs);
        context
    }

    /// Render the document for an environment whose address block is known
    pub fn render_environment(&self, env: &Environment) -> Result<Document> {
        self.environment_document(env, Vec::new())
    }

    /// Render the environment document with import bindings for every
    /// resource already recorded on `env`, so that applying it hands those
    /// resources over to the tool's state
    pub fn adopt_environment(&self, env: &Environment) -> Result<Document> {
        self.environment_document(env, environment_imports(env))
    }

    fn environment_document(&self, env: &Environment, imports: Vec<Import>) -> Result<Document> {
        let cidr_block = env.cidr_block.ok_or_else(|| {
            TerraformError::InvalidParameter(format!(
                "environment {} has no address block",
                env.name
            ))
        })?;

        let mut outputs: Vec<String> = ENVIRONMENT_OUTPUTS.iter().map(|o| o.to_string()).collect();
        if env.domain.is_some() {
            outputs.push(LOAD_BALANCER_OUTPUT.to_string());
        }

        let mut context = self.base_context(&self.environment_module, &env.name, &outputs);
        context.insert("cidr_block", &cidr_block.to_string());
        context.insert("network", &env.network.to_string());
        context.insert("orchestrator", &env.orchestrator.to_string());

        let load_balancer = match (&env.domain, env.load_balancer) {
            (Some(_), Some(lb)) => Some(lb.to_string()),
            (Some(_), None) => {
                return Err(TerraformError::InvalidParameter(format!(
                    "environment {} has a domain but no load balancer",
                    env.name
                )));
            }
            (None, _) => None,
        };
        context.insert("domain", &env.domain);
        context.insert("load_balancer", &load_balancer);
        context.insert("execution_role", &env.resources.execution_role_name);
        context.insert("imports", &imports);

        let text = self.tera.render("environment.tf", &context)?;
        tracing::debug!(environment = %env.name, bytes = text.len(), "Rendered environment document");

        Ok(Document {
            kind: DocumentKind::Environment,
            text,
            outputs,
            imports,
        })
    }

    /// Render the document for a domain's DNS zone and wildcard certificate
    pub fn render_domain(&self, domain: &Domain) -> Result<Document> {
        let outputs: Vec<String> = DOMAIN_OUTPUTS.iter().map(|o| o.to_string()).collect();

        let mut context = self.base_context(&self.domain_module, &domain.name, &outputs);
        context.insert("dns_service", &domain.dns_service.to_string());
        context.insert(
            "certificate_authority",
            &domain.certificate_authority.to_string(),
        );

        let text = self.tera.render("domain.tf", &context)?;
        tracing::debug!(domain = %domain.name, bytes = text.len(), "Rendered domain document");

        Ok(Document {
            kind: DocumentKind::Domain,
            text,
            outputs,
            imports: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envflow_cloud::LoadBalancerKind;

    fn synthesizer() -> Synthesizer {
        Synthesizer::new(
            "eu-west-1",
            ModuleRef::default_environment(),
            ModuleRef::default_domain(),
        )
        .unwrap()
    }

    fn environment(name: &str) -> Environment {
        let mut env = Environment::new(name);
        env.cidr_block = Some("10.2.0.0/16".parse().unwrap());
        env
    }

    #[test]
    fn test_environment_document() {
        let doc = synthesizer().render_environment(&environment("staging")).unwrap();
        let text = doc.text();

        assert_eq!(doc.kind(), DocumentKind::Environment);
        assert!(text.contains("region = \"eu-west-1\""));
        assert!(text.contains("source  = \"envflow/environment/aws\""));
        assert!(text.contains("version = \"1.4.0\""));
        assert!(text.contains("name         = \"staging\""));
        assert!(text.contains("cidr_block   = \"10.2.0.0/16\""));
        assert!(text.contains("orchestrator = \"ecs\""));
        assert!(text.contains("output \"cluster_id\""));
        assert!(text.contains("value = module.environment.vpc_id"));
        assert!(!text.contains("load_balancer"));
        assert_eq!(doc.outputs(), ["vpc_id", "cluster_id"]);
    }

    #[test]
    fn test_environment_document_with_domain() {
        let env = environment("prod").with_domain("example.com", LoadBalancerKind::Alb);
        let doc = synthesizer().render_environment(&env).unwrap();

        assert!(doc.text().contains("domain        = \"example.com\""));
        assert!(doc.text().contains("load_balancer = \"alb\""));
        assert!(doc.outputs().contains(&LOAD_BALANCER_OUTPUT.to_string()));
    }

    #[test]
    fn test_environment_requires_address_block() {
        let err = synthesizer()
            .render_environment(&Environment::new("staging"))
            .unwrap_err();
        assert!(matches!(err, TerraformError::InvalidParameter(_)));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let synth = synthesizer();
        let a = synth.render_environment(&environment("staging")).unwrap();
        let b = synth.render_environment(&environment("staging")).unwrap();
        assert_eq!(a.text().as_bytes(), b.text().as_bytes());

        let other = synthesizer().render_environment(&environment("staging")).unwrap();
        assert_eq!(a, other);
    }

    #[test]
    fn test_name_only_changes_identifier_lines() {
        let synth = synthesizer();
        let a = synth.render_environment(&environment("staging")).unwrap();
        let b = synth.render_environment(&environment("qa")).unwrap();

        let a_lines: Vec<&str> = a.text().lines().collect();
        let b_lines: Vec<&str> = b.text().lines().collect();
        assert_eq!(a_lines.len(), b_lines.len());

        let differing: Vec<(&str, &str)> = a_lines
            .into_iter()
            .zip(b_lines)
            .filter(|(x, y)| x != y)
            .collect();
        assert_eq!(
            differing,
            vec![("  name         = \"staging\"", "  name         = \"qa\"")]
        );
    }

    #[test]
    fn test_adopt_binds_recorded_resources() {
        let mut env = environment("staging");
        env.resources.vpc_id = Some("vpc-0abc".to_string());
        env.resources.internet_gateway_id = Some("igw-0abc".to_string());
        env.resources.route_table_id = Some("rtb-0abc".to_string());

        let doc = synthesizer().adopt_environment(&env).unwrap();
        let text = doc.text();

        assert!(text.contains("  to = module.environment.aws_vpc.this\n  id = \"vpc-0abc\""));
        assert!(text.contains("  id = \"rtb-0abc_0.0.0.0/0\""));
        assert!(!text.contains("aws_subnet.compute"));
        assert!(!text.contains("execution_role"));
        assert_eq!(doc.imports().len(), 3);

        // Teardown renders the same module without bindings
        let plain = synthesizer().render_environment(&env).unwrap();
        assert!(plain.imports().is_empty());
        assert!(!plain.text().contains("import {"));
    }

    #[test]
    fn test_adopt_complete_environment() {
        let mut env = environment("staging");
        env.resources.vpc_id = Some("vpc-1".to_string());
        env.resources.internet_gateway_id = Some("igw-1".to_string());
        env.resources.route_table_id = Some("rtb-1".to_string());
        env.resources.subnet_id = Some("subnet-1".to_string());
        env.resources.execution_role_name = Some("envflow-task-execution".to_string());
        env.resources.cluster_id =
            Some("arn:aws:ecs:eu-west-1:123456789012:cluster/staging".to_string());

        let doc = synthesizer().adopt_environment(&env).unwrap();
        let addresses: Vec<&str> = doc.imports().iter().map(|i| i.address.as_str()).collect();
        assert_eq!(
            addresses,
            [
                "aws_vpc.this",
                "aws_internet_gateway.this",
                "aws_route.default",
                "aws_subnet.compute",
                "aws_ecs_cluster.this",
            ]
        );
        assert_eq!(doc.imports()[4].id, "staging");
        assert!(doc
            .text()
            .contains("execution_role = \"envflow-task-execution\""));
    }

    #[test]
    fn test_domain_document() {
        let doc = synthesizer().render_domain(&Domain::new("example.com")).unwrap();
        let text = doc.text();

        assert_eq!(doc.kind(), DocumentKind::Domain);
        assert!(text.contains("module \"domain\""));
        assert!(text.contains("source  = \"envflow/domain/aws\""));
        assert!(text.contains("name                  = \"example.com\""));
        assert!(text.contains("dns_service           = \"route53\""));
        assert!(text.contains("certificate_authority = \"acm\""));
        assert!(text.contains("value = module.domain.name_servers"));
        assert_eq!(doc.outputs(), ["name_servers", "zone_id", "certificate_arn"]);
    }
}

//! Daemon configuration (`envflow.kdl`)
//!
//! ```kdl
//! listen "127.0.0.1:8420"
//! region "eu-west-1"
//! state-dir "/var/lib/envflow"
//! terraform {
//!     binary "/usr/local/bin/terraform"
//!     timeout-secs 1800
//! }
//! modules {
//!     environment source="envflow/environment/aws" version="1.4.0"
//!     domain source="envflow/domain/aws" version="1.1.0"
//! }
//! sizing {
//!     rounding "at-least"
//! }
//! network {
//!     super-block "10.0.0.0/8"
//!     prefix 16
//! }
//! ```
//!
//! Every setting is optional.

use envflow_cloud::{DEFAULT_ENVIRONMENT_PREFIX, DEFAULT_SUPER_BLOCK, Ipv4Block, RoundingPolicy};
use envflow_controlplane::{ENVIRONMENT_PREFIXES, Settings};
use envflow_terraform::{ModuleRef, Terraform};
use kdl::{KdlDocument, KdlNode};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE: &str = "envflow.kdl";

const DEFAULT_LISTEN: &str = "127.0.0.1:8420";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_TERRAFORM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq)]
pub struct TerraformConfig {
    pub binary: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen: SocketAddr,
    pub region: String,
    pub state_dir: PathBuf,
    pub terraform: TerraformConfig,
    pub environment_module: ModuleRef,
    pub domain_module: ModuleRef,
    pub rounding: RoundingPolicy,
    pub super_block: Ipv4Block,
    pub environment_prefix: u8,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("envflow"))
        .unwrap_or_else(|| PathBuf::from(".envflow"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8420))),
            region: DEFAULT_REGION.to_string(),
            state_dir: default_state_dir(),
            terraform: TerraformConfig {
                binary: PathBuf::from("terraform"),
                timeout: DEFAULT_TERRAFORM_TIMEOUT,
            },
            environment_module: ModuleRef::default_environment(),
            domain_module: ModuleRef::default_domain(),
            rounding: RoundingPolicy::default(),
            super_block: DEFAULT_SUPER_BLOCK,
            environment_prefix: DEFAULT_ENVIRONMENT_PREFIX,
        }
    }
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            region: self.region.clone(),
            state_dir: self.state_dir.clone(),
            environment_module: self.environment_module.clone(),
            domain_module: self.domain_module.clone(),
            super_block: self.super_block,
            environment_prefix: self.environment_prefix,
            rounding: self.rounding,
        }
    }

    pub fn terraform(&self) -> Terraform {
        Terraform::new(&self.terraform.binary).with_timeout(self.terraform.timeout)
    }
}

/// Locate the configuration file.
///
/// An explicit path wins, then `./envflow.kdl`, then
/// `<config_dir>/envflow/envflow.kdl`.
pub fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|d| d.join("envflow").join(CONFIG_FILE))
        .filter(|p| p.exists())
}

/// Load the configuration, falling back to defaults when no file is found
pub fn load(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    let Some(path) = find_config(explicit) else {
        return Ok((Config::default(), None));
    };

    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    Ok((parse(&content)?, Some(path)))
}

fn first_string<'a>(node: &'a KdlNode) -> Option<&'a str> {
    node.entries().first().and_then(|e| e.value().as_string())
}

fn required_string<'a>(node: &'a KdlNode) -> Result<&'a str> {
    first_string(node).ok_or_else(|| {
        ConfigError::Invalid(format!("{} requires a string value", node.name().value()))
    })
}

fn required_integer(node: &KdlNode) -> Result<i128> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| {
            ConfigError::Invalid(format!("{} requires an integer value", node.name().value()))
        })
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn parse_module(node: &KdlNode) -> Result<ModuleRef> {
    let source = node.get("source").and_then(|v| v.as_string());
    let version = node.get("version").and_then(|v| v.as_string());
    match (source, version) {
        (Some(source), Some(version)) => Ok(ModuleRef::new(source, version)),
        _ => Err(ConfigError::Invalid(format!(
            "module {} requires source= and version=",
            node.name().value()
        ))),
    }
}

/// Parse the contents of an `envflow.kdl` file
pub fn parse(content: &str) -> Result<Config> {
    let doc: KdlDocument = content.parse()?;
    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "listen" => {
                let value = required_string(node)?;
                config.listen = value.parse().map_err(|_| {
                    ConfigError::Invalid(format!("listen: '{}' is not a socket address", value))
                })?;
            }
            "region" => config.region = required_string(node)?.to_string(),
            "state-dir" => config.state_dir = PathBuf::from(required_string(node)?),
            "terraform" => {
                for child in children(node) {
                    match child.name().value() {
                        "binary" => {
                            config.terraform.binary = PathBuf::from(required_string(child)?)
                        }
                        "timeout-secs" => {
                            let secs = u64::try_from(required_integer(child)?).map_err(|_| {
                                ConfigError::Invalid("timeout-secs must be positive".to_string())
                            })?;
                            config.terraform.timeout = Duration::from_secs(secs);
                        }
                        other => tracing::warn!(setting = other, "Unknown terraform setting"),
                    }
                }
            }
            "modules" => {
                for child in children(node) {
                    match child.name().value() {
                        "environment" => config.environment_module = parse_module(child)?,
                        "domain" => config.domain_module = parse_module(child)?,
                        other => tracing::warn!(module = other, "Unknown module"),
                    }
                }
            }
            "sizing" => {
                for child in children(node) {
                    match child.name().value() {
                        "rounding" => {
                            config.rounding = required_string(child)?
                                .parse::<RoundingPolicy>()
                                .map_err(ConfigError::Invalid)?;
                        }
                        other => tracing::warn!(setting = other, "Unknown sizing setting"),
                    }
                }
            }
            "network" => {
                for child in children(node) {
                    match child.name().value() {
                        "super-block" => {
                            config.super_block = required_string(child)?
                                .parse::<Ipv4Block>()
                                .map_err(|e: envflow_cloud::CloudError| {
                                    ConfigError::Invalid(e.to_string())
                                })?;
                        }
                        "prefix" => {
                            config.environment_prefix = u8::try_from(required_integer(child)?)
                                .ok()
                                .filter(|p| ENVIRONMENT_PREFIXES.contains(p))
                                .ok_or_else(|| {
                                    ConfigError::Invalid(format!(
                                        "prefix must be between {} and {}",
                                        ENVIRONMENT_PREFIXES.start(),
                                        ENVIRONMENT_PREFIXES.end()
                                    ))
                                })?;
                        }
                        other => tracing::warn!(setting = other, "Unknown network setting"),
                    }
                }
            }
            other => tracing::warn!(setting = other, "Unknown configuration node"),
        }
    }

    if config.environment_prefix < config.super_block.prefix() {
        return Err(ConfigError::Invalid(format!(
            "prefix /{} is larger than super-block {}",
            config.environment_prefix, config.super_block
        )));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen.to_string(), "127.0.0.1:8420");
        assert_eq!(config.rounding, RoundingPolicy::NextTier);
    }

    #[test]
    fn test_full_config() {
        let kdl = r#"
listen "0.0.0.0:9000"
region "eu-west-1"
state-dir "/var/lib/envflow"
terraform {
    binary "/opt/terraform"
    timeout-secs 600
}
modules {
    environment source="acme/env/aws" version="2.0.0"
    domain source="acme/domain/aws" version="0.9.1"
}
sizing {
    rounding "at-least"
}
network {
    super-block "172.16.0.0/12"
    prefix 20
}
"#;
        let config = parse(kdl).unwrap();

        assert_eq!(config.listen.to_string(), "0.0.0.0:9000");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/envflow"));
        assert_eq!(config.terraform.binary, PathBuf::from("/opt/terraform"));
        assert_eq!(config.terraform.timeout, Duration::from_secs(600));
        assert_eq!(config.environment_module, ModuleRef::new("acme/env/aws", "2.0.0"));
        assert_eq!(config.domain_module, ModuleRef::new("acme/domain/aws", "0.9.1"));
        assert_eq!(config.rounding, RoundingPolicy::AtLeast);
        assert_eq!(config.super_block.to_string(), "172.16.0.0/12");
        assert_eq!(config.environment_prefix, 20);

        let settings = config.settings();
        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.environment_prefix, 20);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            parse(r#"listen "nowhere""#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse("sizing {\n    rounding \"nearest\"\n}"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse("network {\n    super-block \"10.0.0.1/8\"\n}"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse("network {\n    prefix 4\n}"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse("modules {\n    environment source=\"x\"\n}"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_prefix_leaves_room_for_compute_subnet() {
        assert_eq!(
            parse("network {\n    prefix 24\n}").unwrap().environment_prefix,
            24
        );
        for prefix in [15, 25, 28, 32] {
            let text = format!("network {{\n    prefix {}\n}}", prefix);
            match parse(&text) {
                Err(ConfigError::Invalid(message)) => {
                    assert_eq!(message, "prefix must be between 16 and 24")
                }
                other => panic!("prefix {} accepted: {:?}", prefix, other),
            }
        }
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "region \"ap-northeast-1\"\n").unwrap();

        let (config, source) = load(Some(&path)).unwrap();
        assert_eq!(config.region, "ap-northeast-1");
        assert_eq!(source, Some(path));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("missing.kdl"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

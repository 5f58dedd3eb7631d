//! Terraform integration for envflow
//!
//! Environment and domain infrastructure is described by externally maintained,
//! versioned Terraform modules. This crate renders the per-instance document
//! that instantiates such a module ([`Synthesizer`]) and runs the `terraform`
//! binary against it ([`Terraform`], behind the [`Provisioner`] trait).
//!
//! # Requirements
//!
//! - `terraform` >= 1.5 must be installed (or its path configured)
//! - Provider credentials are taken from the inherited process environment
//!
//! # Example
//!
//! ```ignore
//! use envflow_terraform::{ModuleRef, Provisioner, Synthesizer, Terraform};
//!
//! let synth = Synthesizer::new("eu-west-1", ModuleRef::default_environment(), ModuleRef::default_domain())?;
//! let document = synth.render_domain(&domain)?;
//!
//! let terraform = Terraform::new("terraform");
//! let outputs = terraform.provision(&work_dir, &document, &cancel).await?;
//! ```

pub mod error;
pub mod executor;
pub mod synth;

pub use error::{Result, TerraformError};
pub use executor::{
    Action, DOCUMENT_FILE, Outputs, Provisioner, Terraform, output_string, output_strings,
    parse_outputs, select_outputs, write_document,
};
pub use synth::{
    DOMAIN_OUTPUTS, Document, DocumentKind, ENVIRONMENT_OUTPUTS, Import, LOAD_BALANCER_OUTPUT,
    ModuleRef, Synthesizer, environment_imports,
};

//! Domain workflow
//!
//! A domain owns a DNS zone and a wildcard certificate, both created by
//! applying the domain document. After creation the user has to delegate the
//! domain to the zone's name servers, which the final progress event lists.

use crate::controlplane::{Context, remove_work_dir};
use crate::error::{ControlPlaneError, Result};
use crate::progress::ProgressSender;
use envflow_cloud::{Domain, Environment, RecordKind};
use envflow_terraform::{output_string, output_strings};
use tokio_util::sync::CancellationToken;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Lowercase DNS name with at least two labels
pub fn validate_domain_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(ControlPlaneError::Validation(format!(
            "invalid domain name '{}': {}",
            name, reason
        )))
    };

    if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
        return invalid("must be 1 to 253 characters long");
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return invalid("must contain at least one '.'");
    }
    for label in labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return invalid("every label must be 1 to 63 characters long");
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return invalid("only lowercase letters, digits, '-' and '.' are allowed");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("labels must not start or end with '-'");
        }
    }
    Ok(())
}

#[tracing::instrument(skip_all, fields(domain = %name))]
pub(crate) async fn create(
    context: &Context,
    name: &str,
    progress: &ProgressSender,
    cancel: &CancellationToken,
) -> Result<()> {
    validate_domain_name(name)?;
    let _claim = context.claims.claim(RecordKind::Domain, name)?;

    if context
        .store
        .record_exists::<Domain>(name)
        .await
        .map_err(ControlPlaneError::Store)?
    {
        return Err(ControlPlaneError::Conflict(format!(
            "domain {} already exists",
            name
        )));
    }

    let mut domain = Domain::new(name);
    let document = context
        .synthesizer
        .render_domain(&domain)
        .map_err(|e| ControlPlaneError::step("render domain document", e))?;

    progress
        .send(format!(
            "Creating DNS zone and wildcard certificate for {}",
            name
        ))
        .await;

    let work_dir = context.settings.work_dir(RecordKind::Domain, name);
    let outputs = context
        .provisioner
        .provision(&work_dir, &document, cancel)
        .await
        .map_err(|e| ControlPlaneError::terraform("apply domain document", e))?;

    let read_outputs = || -> envflow_terraform::Result<(Vec<String>, String, String)> {
        Ok((
            output_strings(&outputs, "name_servers")?,
            output_string(&outputs, "zone_id")?,
            output_string(&outputs, "certificate_arn")?,
        ))
    };
    let (name_servers, zone_id, certificate_arn) =
        read_outputs().map_err(|e| ControlPlaneError::step("read domain outputs", e))?;

    domain.name_servers = name_servers;
    domain.zone_id = Some(zone_id);
    domain.certificate_arn = Some(certificate_arn);
    context
        .store
        .put_record(&domain)
        .await
        .map_err(ControlPlaneError::Store)?;

    progress
        .send(format!(
            "Domain {} is ready. Delegate it to these name servers: {}",
            name,
            domain.name_servers.join(", ")
        ))
        .await;
    Ok(())
}

#[tracing::instrument(skip_all, fields(domain = %name))]
pub(crate) async fn destroy(
    context: &Context,
    name: &str,
    progress: &ProgressSender,
    cancel: &CancellationToken,
) -> Result<()> {
    validate_domain_name(name)?;
    let _claim = context.claims.claim(RecordKind::Domain, name)?;

    let Some(domain) = context
        .store
        .get_record::<Domain>(name)
        .await
        .map_err(ControlPlaneError::Store)?
    else {
        progress
            .send(format!("Domain {} does not exist, nothing to destroy", name))
            .await;
        return Ok(());
    };

    let users: Vec<String> = context
        .store
        .list_records::<Environment>()
        .await
        .map_err(ControlPlaneError::Store)?
        .into_iter()
        .filter(|env| env.domain.as_deref() == Some(name))
        .map(|env| env.name)
        .collect();
    if !users.is_empty() {
        return Err(ControlPlaneError::Conflict(format!(
            "domain {} is still used by environment(s): {}",
            name,
            users.join(", ")
        )));
    }

    let document = context
        .synthesizer
        .render_domain(&domain)
        .map_err(|e| ControlPlaneError::step("render domain document", e))?;

    progress
        .send(format!("Destroying DNS zone and certificate of {}", name))
        .await;

    let work_dir = context.settings.work_dir(RecordKind::Domain, name);
    context
        .provisioner
        .teardown(&work_dir, &document, cancel)
        .await
        .map_err(|e| ControlPlaneError::terraform("destroy domain", e))?;

    context
        .store
        .delete_record::<Domain>(name)
        .await
        .map_err(ControlPlaneError::Store)?;
    remove_work_dir(&work_dir).await;

    progress.send(format!("Domain {} was destroyed", name)).await;
    Ok(())
}

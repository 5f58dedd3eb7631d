//! Per-application infrastructure rows
//!
//! One [`AppInfra`] row per (app, env) pair: created on the first deploy,
//! replaced on redeploy, deleted when the app leaves the environment or the
//! environment is destroyed.

use crate::controlplane::Context;
use crate::error::{ControlPlaneError, Result};
use envflow_cloud::AppInfra;

pub(crate) async fn list(context: &Context, env: &str) -> Result<Vec<AppInfra>> {
    let apps = context
        .store
        .list_records::<AppInfra>()
        .await
        .map_err(ControlPlaneError::Store)?;
    Ok(apps.into_iter().filter(|a| a.env == env).collect())
}

pub(crate) async fn record(context: &Context, mut app: AppInfra) -> Result<()> {
    if app.app.is_empty() {
        return Err(ControlPlaneError::Validation(
            "application name must not be empty".to_string(),
        ));
    }
    if !context
        .store
        .record_exists::<envflow_cloud::Environment>(&app.env)
        .await
        .map_err(ControlPlaneError::Store)?
    {
        return Err(ControlPlaneError::Validation(format!(
            "environment {} does not exist",
            app.env
        )));
    }

    app.updated_at = chrono::Utc::now();
    context
        .store
        .put_record(&app)
        .await
        .map_err(ControlPlaneError::Store)?;
    tracing::info!(app = %app.app, environment = %app.env, "Recorded application infrastructure");
    Ok(())
}

pub(crate) async fn remove(context: &Context, app: &str, env: &str) -> Result<()> {
    context
        .store
        .delete_record::<AppInfra>(&AppInfra::key_for(app, env))
        .await
        .map_err(ControlPlaneError::Store)?;
    tracing::info!(app, environment = env, "Removed application infrastructure");
    Ok(())
}

/// Delete every row belonging to `env`, returning how many were removed
pub(crate) async fn remove_all(context: &Context, env: &str) -> Result<usize> {
    let apps = list(context, env).await?;
    for app in &apps {
        remove(context, &app.app, env).await?;
    }
    Ok(apps.len())
}

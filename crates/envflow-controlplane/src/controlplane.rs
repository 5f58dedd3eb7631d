//! The control plane: shared services plus one spawned task per operation

use crate::allocator::{AddressAllocator, CloudAndStoreBlocks};
use crate::environment::CreateEnvironment;
use crate::error::{ControlPlaneError, Result};
use crate::progress::{self, DEFAULT_CAPACITY, ProgressStream};
use crate::{apps, domain, environment};
use envflow_cloud::{
    AppInfra, CloudApi, DEFAULT_ENVIRONMENT_PREFIX, DEFAULT_SUPER_BLOCK, Domain, Environment,
    Ipv4Block, RecordKind, RecordStore, RoundingPolicy, TaskSize,
};
use envflow_terraform::{ModuleRef, Provisioner, Synthesizer};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Control plane settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cloud region every document targets
    pub region: String,
    /// Root of the record store and the tool working directories
    pub state_dir: PathBuf,
    pub environment_module: ModuleRef,
    pub domain_module: ModuleRef,
    /// Address space environment networks are carved from
    pub super_block: Ipv4Block,
    /// Prefix length of one environment network
    pub environment_prefix: u8,
    pub rounding: RoundingPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            state_dir: PathBuf::from(".envflow"),
            environment_module: ModuleRef::default_environment(),
            domain_module: ModuleRef::default_domain(),
            super_block: DEFAULT_SUPER_BLOCK,
            environment_prefix: DEFAULT_ENVIRONMENT_PREFIX,
            rounding: RoundingPolicy::default(),
        }
    }
}

impl Settings {
    /// Working directory of one environment or domain document
    pub fn work_dir(&self, kind: RecordKind, name: &str) -> PathBuf {
        self.state_dir.join("work").join(kind.as_str()).join(name)
    }
}

/// Names with an operation in flight
#[derive(Default)]
pub(crate) struct Claims {
    held: Arc<Mutex<BTreeSet<(RecordKind, String)>>>,
}

impl Claims {
    pub(crate) fn claim(&self, kind: RecordKind, name: &str) -> Result<Claim> {
        let key = (kind, name.to_string());
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return Err(ControlPlaneError::Conflict(format!(
                "another operation on {}/{} is still running",
                kind, name
            )));
        }
        Ok(Claim {
            key,
            held: Arc::clone(&self.held),
        })
    }
}

pub(crate) struct Claim {
    key: (RecordKind, String),
    held: Arc<Mutex<BTreeSet<(RecordKind, String)>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Services shared by every workflow
pub(crate) struct Context {
    pub(crate) cloud: Arc<dyn CloudApi>,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    pub(crate) synthesizer: Synthesizer,
    pub(crate) allocator: AddressAllocator,
    pub(crate) claims: Claims,
    pub(crate) settings: Settings,
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    stage: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ControlPlaneError::Cancelled(stage.to_string())),
        result = fut => result,
    }
}

/// Remove a working directory that is no longer needed
pub(crate) async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Could not remove working directory"),
    }
}

/// Entry point for environment and domain operations
///
/// Cheap to clone. Each long operation runs on its own tokio task and reports
/// through the returned [`ProgressStream`]; dropping the stream does not stop
/// the operation, cancelling its token does.
#[derive(Clone)]
pub struct ControlPlane {
    context: Arc<Context>,
}

impl ControlPlane {
    pub fn new(
        settings: Settings,
        cloud: Arc<dyn CloudApi>,
        store: Arc<dyn RecordStore>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self> {
        let synthesizer = Synthesizer::new(
            settings.region.clone(),
            settings.environment_module.clone(),
            settings.domain_module.clone(),
        )
        .map_err(|e| ControlPlaneError::Config(e.to_string()))?;

        let allocator = AddressAllocator::new(
            Arc::new(CloudAndStoreBlocks::new(
                Arc::clone(&cloud),
                Arc::clone(&store),
            )),
            settings.super_block,
            settings.environment_prefix,
        );

        tracing::info!(
            cloud = cloud.name(),
            region = %settings.region,
            state_dir = %settings.state_dir.display(),
            "Control plane ready"
        );

        Ok(Self {
            context: Arc::new(Context {
                cloud,
                store,
                provisioner,
                synthesizer,
                allocator,
                claims: Claims::default(),
                settings,
            }),
        })
    }

    /// AWS SDK cloud, file record store under `state_dir` and the terraform CLI
    #[cfg(feature = "aws-cloud")]
    pub async fn aws(
        settings: Settings,
        terraform: envflow_terraform::Terraform,
        retry: &envflow_cloud::RetryConfig,
    ) -> Result<Self> {
        let cloud = envflow_cloud_aws::AwsCloud::connect(settings.region.clone(), retry).await;
        let store = envflow_cloud::FileStore::new(&settings.state_dir);
        Self::new(settings, Arc::new(cloud), Arc::new(store), Arc::new(terraform))
    }

    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    pub fn create_environment(
        &self,
        request: CreateEnvironment,
        cancel: CancellationToken,
    ) -> ProgressStream {
        let (tx, stream) = progress::channel(DEFAULT_CAPACITY);
        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            let result = environment::create(&context, &request, &tx, &cancel).await;
            tx.complete(result).await;
        });
        stream
    }

    pub fn destroy_environment(&self, name: &str, cancel: CancellationToken) -> ProgressStream {
        let (tx, stream) = progress::channel(DEFAULT_CAPACITY);
        let context = Arc::clone(&self.context);
        let name = name.to_string();
        tokio::spawn(async move {
            let result = environment::destroy(&context, &name, &tx, &cancel).await;
            tx.complete(result).await;
        });
        stream
    }

    pub fn create_domain(&self, name: &str, cancel: CancellationToken) -> ProgressStream {
        let (tx, stream) = progress::channel(DEFAULT_CAPACITY);
        let context = Arc::clone(&self.context);
        let name = name.to_string();
        tokio::spawn(async move {
            let result = domain::create(&context, &name, &tx, &cancel).await;
            tx.complete(result).await;
        });
        stream
    }

    pub fn destroy_domain(&self, name: &str, cancel: CancellationToken) -> ProgressStream {
        let (tx, stream) = progress::channel(DEFAULT_CAPACITY);
        let context = Arc::clone(&self.context);
        let name = name.to_string();
        tokio::spawn(async move {
            let result = domain::destroy(&context, &name, &tx, &cancel).await;
            tx.complete(result).await;
        });
        stream
    }

    pub async fn environment(&self, name: &str) -> Result<Option<Environment>> {
        self.context
            .store
            .get_record::<Environment>(name)
            .await
            .map_err(ControlPlaneError::Store)
    }

    pub async fn environments(&self) -> Result<Vec<Environment>> {
        self.context
            .store
            .list_records::<Environment>()
            .await
            .map_err(ControlPlaneError::Store)
    }

    pub async fn domains(&self) -> Result<Vec<Domain>> {
        self.context
            .store
            .list_records::<Domain>()
            .await
            .map_err(ControlPlaneError::Store)
    }

    /// Applications deployed into `env`
    pub async fn apps(&self, env: &str) -> Result<Vec<AppInfra>> {
        apps::list(&self.context, env).await
    }

    /// Insert or update the infrastructure row of one application
    pub async fn record_app(&self, app: AppInfra) -> Result<()> {
        apps::record(&self.context, app).await
    }

    pub async fn remove_app(&self, app: &str, env: &str) -> Result<()> {
        apps::remove(&self.context, app, env).await
    }

    /// Round a requested task size to a supported pair under the configured policy
    pub fn normalize_size(&self, requested: TaskSize) -> TaskSize {
        envflow_cloud::normalize(requested, self.context.settings.rounding)
    }
}

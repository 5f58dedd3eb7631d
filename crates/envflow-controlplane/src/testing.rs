//! In-memory fakes for exercising workflows without a cloud or terraform

use async_trait::async_trait;
use envflow_cloud::{CloudApi, CloudError, Ipv4Block};
use envflow_terraform::{
    Action, Document, DocumentKind, LOAD_BALANCER_OUTPUT, Outputs, Provisioner, TerraformError,
    select_outputs, write_document,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted [`CloudApi`] that records every call by method name
#[derive(Default)]
pub struct FakeCloud {
    networks: Mutex<Vec<Ipv4Block>>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Networks that already exist outside envflow
    pub fn with_networks(self, blocks: impl IntoIterator<Item = Ipv4Block>) -> Self {
        lock(&self.networks).extend(blocks);
        self
    }

    /// Make every call of `method` fail
    pub fn fail_on(&self, method: &str) {
        *lock(&self.fail_on) = Some(method.to_string());
    }

    /// Sleep this long inside every creating call
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn networks(&self) -> Vec<Ipv4Block> {
        lock(&self.networks).clone()
    }

    async fn call(&self, method: &str) -> envflow_cloud::Result<usize> {
        let count = {
            let mut calls = lock(&self.calls);
            calls.push(method.to_string());
            calls.iter().filter(|c| *c == method).count()
        };

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.fail_on).as_deref() == Some(method) {
            return Err(CloudError::ApiError(format!("{} rejected by fake cloud", method)));
        }
        Ok(count)
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    fn name(&self) -> &str {
        "fake"
    }

    async fn network_blocks(&self) -> envflow_cloud::Result<Vec<Ipv4Block>> {
        lock(&self.calls).push("network_blocks".to_string());
        Ok(self.networks())
    }

    async fn create_network(&self, _name: &str, block: Ipv4Block) -> envflow_cloud::Result<String> {
        let n = self.call("create_network").await?;
        lock(&self.networks).push(block);
        Ok(format!("vpc-{}", n))
    }

    async fn create_internet_gateway(&self, _name: &str) -> envflow_cloud::Result<String> {
        let n = self.call("create_internet_gateway").await?;
        Ok(format!("igw-{}", n))
    }

    async fn attach_internet_gateway(
        &self,
        _gateway_id: &str,
        _network_id: &str,
    ) -> envflow_cloud::Result<()> {
        self.call("attach_internet_gateway").await?;
        Ok(())
    }

    async fn create_default_route(
        &self,
        _network_id: &str,
        _gateway_id: &str,
    ) -> envflow_cloud::Result<String> {
        let n = self.call("create_default_route").await?;
        Ok(format!("rtb-{}", n))
    }

    async fn create_subnet(
        &self,
        _name: &str,
        _network_id: &str,
        _block: Ipv4Block,
    ) -> envflow_cloud::Result<String> {
        let n = self.call("create_subnet").await?;
        Ok(format!("subnet-{}", n))
    }

    async fn ensure_execution_role(&self, role_name: &str) -> envflow_cloud::Result<String> {
        self.call("ensure_execution_role").await?;
        Ok(role_name.to_string())
    }

    async fn create_cluster(&self, name: &str) -> envflow_cloud::Result<String> {
        self.call("create_cluster").await?;
        Ok(format!("arn:fake:ecs:cluster/{}", name))
    }
}

/// [`Provisioner`] that records actions instead of running a tool
#[derive(Default)]
pub struct RecordingProvisioner {
    actions: Mutex<Vec<(Action, PathBuf)>>,
    outputs: Mutex<Outputs>,
    fail_on: Mutex<Option<Action>>,
}

impl RecordingProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs reported after apply
    ///
    /// Environment documents additionally report the ids of the resources
    /// they import, unless set here.
    pub fn with_outputs(self, outputs: Outputs) -> Self {
        *lock(&self.outputs) = outputs;
        self
    }

    /// Outputs of a successfully applied domain document
    pub fn domain_outputs() -> Outputs {
        Outputs::from([
            (
                "name_servers".to_string(),
                serde_json::json!(["ns-1.example.net", "ns-2.example.org"]),
            ),
            ("zone_id".to_string(), serde_json::json!("Z123")),
            (
                "certificate_arn".to_string(),
                serde_json::json!("arn:fake:acm:certificate/1"),
            ),
        ])
    }

    pub fn fail_on(&self, action: Action) {
        *lock(&self.fail_on) = Some(action);
    }

    pub fn actions(&self) -> Vec<Action> {
        lock(&self.actions).iter().map(|(a, _)| *a).collect()
    }

    pub fn work_dirs(&self) -> Vec<PathBuf> {
        lock(&self.actions).iter().map(|(_, d)| d.clone()).collect()
    }

    fn record(&self, action: Action, work_dir: &Path) -> envflow_terraform::Result<()> {
        lock(&self.actions).push((action, work_dir.to_path_buf()));
        if *lock(&self.fail_on) == Some(action) {
            return Err(action.failure("scripted failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn init(&self, work_dir: &Path, cancel: &CancellationToken) -> envflow_terraform::Result<()> {
        if cancel.is_cancelled() {
            return Err(TerraformError::Cancelled(Action::Init));
        }
        self.record(Action::Init, work_dir)
    }

    async fn apply(&self, work_dir: &Path, cancel: &CancellationToken) -> envflow_terraform::Result<()> {
        if cancel.is_cancelled() {
            return Err(TerraformError::Cancelled(Action::Apply));
        }
        self.record(Action::Apply, work_dir)
    }

    async fn destroy(&self, work_dir: &Path, cancel: &CancellationToken) -> envflow_terraform::Result<()> {
        if cancel.is_cancelled() {
            return Err(TerraformError::Cancelled(Action::Destroy));
        }
        self.record(Action::Destroy, work_dir)
    }

    async fn outputs(&self, work_dir: &Path) -> envflow_terraform::Result<Outputs> {
        self.record(Action::Output, work_dir)?;
        Ok(lock(&self.outputs).clone())
    }

    async fn provision(
        &self,
        work_dir: &Path,
        document: &Document,
        cancel: &CancellationToken,
    ) -> envflow_terraform::Result<Outputs> {
        write_document(work_dir, document).await?;
        self.init(work_dir, cancel).await?;
        self.apply(work_dir, cancel).await?;
        let mut outputs = self.outputs(work_dir).await?;

        if document.kind() == DocumentKind::Environment {
            for binding in document.imports() {
                let (name, value) = match binding.address.as_str() {
                    "aws_vpc.this" => ("vpc_id", binding.id.clone()),
                    "aws_ecs_cluster.this" => {
                        ("cluster_id", format!("arn:fake:ecs:cluster/{}", binding.id))
                    }
                    _ => continue,
                };
                outputs
                    .entry(name.to_string())
                    .or_insert_with(|| serde_json::json!(value));
            }
            if document.outputs().iter().any(|o| o == LOAD_BALANCER_OUTPUT) {
                let env = work_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                outputs
                    .entry(LOAD_BALANCER_OUTPUT.to_string())
                    .or_insert_with(|| serde_json::json!(format!("{}-lb.elb.fake", env)));
            }
        }

        select_outputs(outputs, document.outputs())
    }
}

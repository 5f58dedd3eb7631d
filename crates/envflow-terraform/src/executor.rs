//! terraform CLI wrapper
//!
//! Writes a rendered [`Document`] into a working directory and drives
//! `terraform init`, `apply`/`destroy` and `output -json` against it. Every line
//! the tool prints is forwarded to the log as it arrives; applies routinely take
//! several minutes.

use crate::error::{Result, TerraformError};
use crate::synth::Document;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// File name of the document inside a working directory
pub const DOCUMENT_FILE: &str = "main.tf";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const OUTPUT_TIMEOUT: Duration = Duration::from_secs(60);

/// stderr lines kept for the error message of a failed run
const STDERR_TAIL_LINES: usize = 20;

/// How long the output readers may keep draining after the process was killed.
/// A grandchild (version-manager shims, wrapper scripts) can hold the pipes open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Outputs read back from the tool, keyed by output name
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// A tool invocation, used for logging and error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Init,
    Apply,
    Destroy,
    Output,
}

impl Action {
    /// The error reported when this invocation fails with `message`
    pub fn failure(self, message: String) -> TerraformError {
        match self {
            Action::Init => TerraformError::Init(message),
            Action::Apply => TerraformError::Apply(message),
            Action::Destroy => TerraformError::Destroy(message),
            Action::Output => TerraformError::Output(message),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Init => write!(f, "init"),
            Action::Apply => write!(f, "apply"),
            Action::Destroy => write!(f, "destroy"),
            Action::Output => write!(f, "output"),
        }
    }
}

/// Declarative provisioning tool
///
/// `provision` and `teardown` compose the primitive operations; implementations
/// normally only provide the primitives.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn init(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<()>;

    async fn apply(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<()>;

    async fn destroy(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Every output of the last apply in `work_dir`
    async fn outputs(&self, work_dir: &Path) -> Result<Outputs>;

    /// Write the document, init, apply, and return the outputs it declares
    async fn provision(
        &self,
        work_dir: &Path,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<Outputs> {
        write_document(work_dir, document).await?;
        self.init(work_dir, cancel).await?;
        self.apply(work_dir, cancel).await?;
        let outputs = self.outputs(work_dir).await?;
        select_outputs(outputs, document.outputs())
    }

    /// Write the document, init, and destroy everything it manages
    async fn teardown(
        &self,
        work_dir: &Path,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<()> {
        write_document(work_dir, document).await?;
        self.init(work_dir, cancel).await?;
        self.destroy(work_dir, cancel).await
    }
}

/// Write `document` to `<work_dir>/main.tf`, creating the directory
pub async fn write_document(work_dir: &Path, document: &Document) -> Result<()> {
    tokio::fs::create_dir_all(work_dir).await?;
    tokio::fs::write(work_dir.join(DOCUMENT_FILE), document.text()).await?;
    debug!(work_dir = %work_dir.display(), "Wrote document");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

/// Parse `terraform output -json`
pub fn parse_outputs(json: &str) -> Result<Outputs> {
    if json.trim().is_empty() {
        return Ok(Outputs::new());
    }

    let raw: BTreeMap<String, RawOutput> =
        serde_json::from_str(json).map_err(|e| TerraformError::OutputParse(e.to_string()))?;

    Ok(raw
        .into_iter()
        .map(|(name, output)| {
            if output.sensitive {
                debug!(output = %name, "Read sensitive output");
            }
            (name, output.value)
        })
        .collect())
}

/// Keep only the `declared` outputs; a declared output that is missing is an error
pub fn select_outputs(mut all: Outputs, declared: &[String]) -> Result<Outputs> {
    declared
        .iter()
        .map(|name| {
            all.remove(name)
                .map(|value| (name.clone(), value))
                .ok_or_else(|| {
                    TerraformError::OutputParse(format!("declared output '{}' is missing", name))
                })
        })
        .collect()
}

/// A string output
pub fn output_string(outputs: &Outputs, name: &str) -> Result<String> {
    outputs
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| TerraformError::OutputParse(format!("output '{}' is not a string", name)))
}

/// A list-of-strings output
pub fn output_strings(outputs: &Outputs, name: &str) -> Result<Vec<String>> {
    let invalid =
        || TerraformError::OutputParse(format!("output '{}' is not a list of strings", name));

    outputs
        .get(name)
        .and_then(|v| v.as_array())
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()).ok_or_else(invalid))
        .collect()
}

/// terraform CLI wrapper
pub struct Terraform {
    binary: PathBuf,
    timeout: Duration,
    env: Vec<(String, String)>,
}

impl Terraform {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
            env: vec![
                ("TF_IN_AUTOMATION".to_string(), "1".to_string()),
                ("TF_INPUT".to_string(), "0".to_string()),
            ],
        }
    }

    /// Upper bound for a single init/apply/destroy run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra environment variable on top of the inherited host environment
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, args: &[&str], work_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(work_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, err: std::io::Error) -> TerraformError {
        if err.kind() == std::io::ErrorKind::NotFound {
            TerraformError::BinaryNotFound(self.binary.display().to_string())
        } else {
            TerraformError::Io(err)
        }
    }

    /// Run a command, streaming its output into the log
    async fn run_streaming(
        &self,
        action: Action,
        args: &[&str],
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(
            action = %action,
            work_dir = %work_dir.display(),
            "Running: {} {}",
            self.binary.display(),
            args.join(" ")
        );

        let mut child = self
            .command(args, work_dir)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdout_task = tokio::spawn(forward_lines(child.stdout.take(), action, "stdout"));
        let mut stderr_task = tokio::spawn(forward_lines(child.stderr.take(), action, "stderr"));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(action = %action, "terraform cancelled, killing process");
                let _ = child.kill().await;
                Err(TerraformError::Cancelled(action))
            }
            _ = tokio::time::sleep(self.timeout) => {
                error!(action = %action, "terraform timed out after {:?}", self.timeout);
                let _ = child.kill().await;
                Err(TerraformError::Timeout { action, timeout: self.timeout })
            }
            status = child.wait() => status.map_err(TerraformError::from),
        };

        let stderr_tail = if outcome.is_ok() {
            let _ = stdout_task.await;
            stderr_task.await.unwrap_or_default()
        } else {
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                let _ = (&mut stdout_task).await;
                (&mut stderr_task).await.unwrap_or_default()
            })
            .await;
            if drained.is_err() {
                warn!(action = %action, "Output still open after kill, no longer reading it");
                stdout_task.abort();
                stderr_task.abort();
            }
            drained.unwrap_or_default()
        };

        let status = outcome?;
        if !status.success() {
            let detail = if stderr_tail.is_empty() {
                String::new()
            } else {
                format!(": {}", stderr_tail.join("\n"))
            };
            return Err(action.failure(format!("exited with {}{}", status, detail)));
        }

        info!(action = %action, "terraform {} finished", action);
        Ok(())
    }
}

/// Log every line of a child stream and return the last few lines
async fn forward_lines<R>(reader: Option<R>, action: Action, stream: &'static str) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let Some(reader) = reader else {
        return Vec::new();
    };

    // Read raw bytes: the tool may print text that is not UTF-8, and the pipe
    // has to be drained to the end either way
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(action = %action, stream, "Failed to read terraform output: {}", e);
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        if stream == "stderr" {
            warn!(action = %action, stream, "{}", line);
        } else {
            info!(action = %action, stream, "{}", line);
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into()
}

#[async_trait]
impl Provisioner for Terraform {
    async fn init(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<()> {
        self.run_streaming(
            Action::Init,
            &["init", "-input=false", "-no-color"],
            work_dir,
            cancel,
        )
        .await
    }

    async fn apply(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<()> {
        self.run_streaming(
            Action::Apply,
            &["apply", "-auto-approve", "-input=false", "-no-color"],
            work_dir,
            cancel,
        )
        .await
    }

    async fn destroy(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<()> {
        self.run_streaming(
            Action::Destroy,
            &["destroy", "-auto-approve", "-input=false", "-no-color"],
            work_dir,
            cancel,
        )
        .await
    }

    async fn outputs(&self, work_dir: &Path) -> Result<Outputs> {
        debug!(work_dir = %work_dir.display(), "Reading terraform outputs");

        let output = tokio::time::timeout(
            OUTPUT_TIMEOUT,
            self.command(&["output", "-json", "-no-color"], work_dir)
                .output(),
        )
        .await
        .map_err(|_| TerraformError::Timeout {
            action: Action::Output,
            timeout: OUTPUT_TIMEOUT,
        })?
        .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Action::Output.failure(stderr.trim().to_string()));
        }

        parse_outputs(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{ModuleRef, Synthesizer};
    use envflow_cloud::Environment;
    use tempfile::tempdir;

    const OUTPUT_JSON: &str = r#"{
        "cluster_id": {"sensitive": false, "type": "string", "value": "arn:aws:ecs:cluster/staging"},
        "vpc_id": {"sensitive": false, "type": "string", "value": "vpc-0abc"},
        "name_servers": {"sensitive": false, "type": ["list", "string"], "value": ["ns-1.example", "ns-2.example"]},
        "secret": {"sensitive": true, "type": "string", "value": "hunter2"}
    }"#;

    fn document() -> Document {
        let synth = Synthesizer::new(
            "us-east-1",
            ModuleRef::default_environment(),
            ModuleRef::default_domain(),
        )
        .unwrap();
        let mut env = Environment::new("staging");
        env.cidr_block = Some("10.0.0.0/16".parse().unwrap());
        synth.render_environment(&env).unwrap()
    }

    #[cfg(unix)]
    fn fake_terraform(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-terraform");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_parse_outputs() {
        let outputs = parse_outputs(OUTPUT_JSON).unwrap();
        assert_eq!(outputs.len(), 4);
        assert_eq!(output_string(&outputs, "vpc_id").unwrap(), "vpc-0abc");
        assert_eq!(
            output_strings(&outputs, "name_servers").unwrap(),
            vec!["ns-1.example", "ns-2.example"]
        );
        assert!(output_string(&outputs, "name_servers").is_err());
        assert!(output_strings(&outputs, "vpc_id").is_err());
    }

    #[test]
    fn test_parse_outputs_empty_and_invalid() {
        assert!(parse_outputs("").unwrap().is_empty());
        assert!(parse_outputs("{}").unwrap().is_empty());
        assert!(matches!(
            parse_outputs("not json"),
            Err(TerraformError::OutputParse(_))
        ));
        assert!(matches!(
            parse_outputs(r#"{"vpc_id": "vpc-1"}"#),
            Err(TerraformError::OutputParse(_))
        ));
    }

    #[test]
    fn test_select_outputs() {
        let all = parse_outputs(OUTPUT_JSON).unwrap();
        let declared = vec!["vpc_id".to_string(), "cluster_id".to_string()];
        let selected = select_outputs(all.clone(), &declared).unwrap();
        assert_eq!(selected.keys().collect::<Vec<_>>(), vec!["cluster_id", "vpc_id"]);

        let missing = vec!["load_balancer_dns_name".to_string()];
        assert!(matches!(
            select_outputs(all, &missing),
            Err(TerraformError::OutputParse(_))
        ));
    }

    #[tokio::test]
    async fn test_write_document() {
        let temp_dir = tempdir().unwrap();
        let work_dir = temp_dir.path().join("environments/staging");
        let doc = document();

        write_document(&work_dir, &doc).await.unwrap();
        let written = std::fs::read_to_string(work_dir.join(DOCUMENT_FILE)).unwrap();
        assert_eq!(written, doc.text());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let temp_dir = tempdir().unwrap();
        let terraform = Terraform::new(temp_dir.path().join("no-such-terraform"));
        let err = terraform
            .init(temp_dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TerraformError::BinaryNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_provision_returns_declared_outputs() {
        let temp_dir = tempdir().unwrap();
        let script = format!(
            "case \"$1\" in\n  output) cat <<'JSON'\n{}\nJSON\n  ;;\n  *) echo \"fake $1\" ;;\nesac",
            OUTPUT_JSON
        );
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), &script));
        let work_dir = temp_dir.path().join("work");

        let outputs = terraform
            .provision(&work_dir, &document(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(output_string(&outputs, "vpc_id").unwrap(), "vpc-0abc");
        assert!(work_dir.join(DOCUMENT_FILE).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failures_map_to_action() {
        let temp_dir = tempdir().unwrap();
        let script = "echo \"boom during $1\" >&2\n[ \"$1\" = init ] && exit 0\nexit 3";
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), script));
        let cancel = CancellationToken::new();

        terraform.init(temp_dir.path(), &cancel).await.unwrap();

        match terraform.apply(temp_dir.path(), &cancel).await.unwrap_err() {
            TerraformError::Apply(message) => assert!(message.contains("boom during apply")),
            other => panic!("expected apply failure, got {other:?}"),
        }
        assert!(matches!(
            terraform.destroy(temp_dir.path(), &cancel).await,
            Err(TerraformError::Destroy(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_init_failure() {
        let temp_dir = tempdir().unwrap();
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), "exit 1"));
        let err = terraform
            .provision(temp_dir.path(), &document(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TerraformError::Init(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let temp_dir = tempdir().unwrap();
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), "exec sleep 10"))
            .with_timeout(Duration::from_millis(200));
        let err = terraform
            .apply(temp_dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TerraformError::Timeout {
                action: Action::Apply,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_with_grandchild_holding_output() {
        let temp_dir = tempdir().unwrap();
        // sh forks sleep, which keeps stdout open after sh is killed
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), "sleep 10"))
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = terraform
            .apply(temp_dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(err.to_string(), "terraform apply timed out after 200ms");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_output_is_drained() {
        let temp_dir = tempdir().unwrap();
        let script = "printf 'caf\\351\\n'\ni=0\nwhile [ $i -lt 20000 ]; do echo \"line $i\"; i=$((i+1)); done\nexit 0";
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), script));

        terraform
            .apply(temp_dir.path(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_every_line_reaches_the_log() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(log.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        // Current-thread runtime: the reader tasks run on this thread too
        let _guard = tracing::subscriber::set_default(subscriber);

        let temp_dir = tempdir().unwrap();
        let script = "echo 'Plan: 3 to add'\nprintf 'caf\\351\\n'\necho 'Warning: deprecated argument' >&2\necho 'Apply complete!'";
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), script));
        terraform
            .apply(temp_dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        let contents = log.contents();
        for line in [
            "Plan: 3 to add",
            "caf\u{FFFD}",
            "Warning: deprecated argument",
            "Apply complete!",
        ] {
            assert!(contents.contains(line), "missing {:?} in log:\n{}", line, contents);
        }
        assert!(contents.contains("stderr"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel() {
        let temp_dir = tempdir().unwrap();
        let terraform = Terraform::new(fake_terraform(temp_dir.path(), "exec sleep 10"));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = terraform.destroy(temp_dir.path(), &cancel).await.unwrap_err();
        assert!(matches!(err, TerraformError::Cancelled(Action::Destroy)));
    }
}

//! Bounded execution of one external command inside a tenant workspace.
//!
//! Every failure mode (spawn error, timeout, non-zero exit) is folded into an
//! [`OperationResult`]; nothing escapes this boundary as an error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Upper bound on the failure text carried in a result, in characters.
pub const MAX_FAILURE_OUTPUT: usize = 4000;

pub const DEFAULT_CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// A program and its arguments, plus the name of the log artifact to leave in
/// the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub log_name: Option<String>,
}

impl ToolCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            log_name: None,
        }
    }

    pub fn with_log(mut self, name: impl Into<String>) -> Self {
        self.log_name = Some(name.into());
        self
    }

    /// Program name plus first argument, e.g. `terraform apply`.
    pub fn label(&self) -> String {
        let program = Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone());
        match self.args.first() {
            Some(verb) => format!("{} {}", program, verb),
            None => program,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub success: bool,
    pub output: String,
    pub failure_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl OperationResult {
    fn succeeded(output: String) -> Self {
        Self {
            success: true,
            output,
            failure_reason: None,
            exit_code: Some(0),
            timed_out: false,
        }
    }

    fn failed(reason: String, output: String, exit_code: Option<i32>, timed_out: bool) -> Self {
        Self {
            success: false,
            output,
            failure_reason: Some(reason),
            exit_code,
            timed_out,
        }
    }

    /// Text to show for a failed run.
    pub fn failure_message(&self) -> &str {
        self.failure_reason.as_deref().unwrap_or(&self.output)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    credentials_file: Option<String>,
    credentials_env: String,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            credentials_file: None,
            credentials_env: DEFAULT_CREDENTIALS_ENV.to_string(),
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `env_var` at `<workspace>/<file_name>` whenever that file exists.
    pub fn with_credentials(mut self, file_name: impl Into<String>, env_var: impl Into<String>) -> Self {
        self.credentials_file = Some(file_name.into());
        self.credentials_env = env_var.into();
        self
    }

    fn credentials_path(&self, workspace: &Path) -> Option<PathBuf> {
        let path = workspace.join(self.credentials_file.as_ref()?);
        path.is_file().then_some(path)
    }

    #[instrument(skip(self, command), fields(command = %command.label(), workspace = %workspace.display()))]
    pub async fn run(
        &self,
        workspace: &Path,
        command: &ToolCommand,
        timeout: Duration,
    ) -> OperationResult {
        let label = command.label();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(credentials) = self.credentials_path(workspace) {
            cmd.env(&self.credentials_env, credentials);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to start {}: {}", label, e);
                warn!("{}", reason);
                return OperationResult::failed(reason, String::new(), None, false);
            }
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let reason = format!("error waiting for {}: {}", label, e);
                warn!("{}", reason);
                return OperationResult::failed(reason, String::new(), None, false);
            }
            Err(_) => {
                // Dropping the wait future drops the child, which kills it.
                let reason = format!("{} timed out after {} seconds", label, format_secs(timeout));
                warn!("{}", reason);
                self.write_log(workspace, command, &reason).await;
                return OperationResult::failed(reason.clone(), reason, None, true);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        self.write_log(workspace, command, &format!("{}\n{}", stdout, stderr))
            .await;

        if output.status.success() {
            debug!("{} succeeded", label);
            return OperationResult::succeeded(stdout);
        }

        let captured = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        let captured = tail_chars(captured, MAX_FAILURE_OUTPUT);
        warn!(exit_code = ?output.status.code(), "{} failed", label);

        OperationResult::failed(
            captured.clone(),
            captured,
            output.status.code(),
            false,
        )
    }

    async fn write_log(&self, workspace: &Path, command: &ToolCommand, content: &str) {
        let Some(name) = &command.log_name else {
            return;
        };
        let path = workspace.join(format!("{}.log", name));
        if let Err(e) = tokio::fs::write(&path, content).await {
            warn!("Failed to write log artifact {}: {}", path.display(), e);
        }
    }
}

fn format_secs(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.1}", duration.as_secs_f64())
    }
}

/// Last `max` characters of `text`, marked when something was cut.
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max).collect();
    format!("...(truncated)\n{}", tail)
}

use futures_util::future::BoxFuture;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("command exited with {}", describe_exit(.code))]
    Failed { code: Option<i32>, output: String },
}

impl ExecError {
    /// Whatever the command printed before failing.
    pub fn output(&self) -> &str {
        match self {
            ExecError::Spawn { .. } => "",
            ExecError::Failed { output, .. } => output,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Runs command text and returns its captured output.
pub trait Execute: Send + Sync + 'static {
    fn execute<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, ExecError>>;
}

/// Hands command text verbatim to the host shell.
///
/// There is no timeout: a command that never exits holds its caller forever.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    program: String,
    flag: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("cmd.exe", "/C")
        } else {
            Self::new("sh", "-c")
        }
    }
}

impl ShellExecutor {
    pub fn new(program: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flag: flag.into(),
        }
    }

    pub async fn run(&self, command: &str) -> Result<String, ExecError> {
        let output = Command::new(&self.program)
            .arg(&self.flag)
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ExecError::Spawn {
                program: self.program.clone(),
                reason: err.to_string(),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(text)
        } else {
            Err(ExecError::Failed {
                code: output.status.code(),
                output: text,
            })
        }
    }
}

impl Execute for ShellExecutor {
    fn execute<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, ExecError>> {
        Box::pin(self.run(command))
    }
}

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::Probe;
use crate::{Job, ResultValue};

/// Classification of a check script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Still running at the deadline and killed.
    Timeout,
    /// Exited with status 0.
    Pass,
    /// Any other exit, or still running because the kill failed.
    Fail,
}

impl ScriptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptOutcome::Timeout => "timeout",
            ScriptOutcome::Pass => "pass",
            ScriptOutcome::Fail => "fail",
        }
    }
}

/// Deadline for a script run: one second short of the job period.
pub fn script_deadline(frequency: u64) -> Duration {
    Duration::from_secs(frequency.saturating_sub(1).max(1))
}

/// Runs `/bin/sh <path>` with its output discarded.
pub async fn run_script(path: &str, deadline: Duration) -> anyhow::Result<ScriptOutcome> {
    let mut child = Command::new("/bin/sh")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("unable to start script {path}"))?;

    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => {
            let status = status.with_context(|| format!("unable to wait for script {path}"))?;
            debug!("script {path} exited with {status}");
            if status.success() {
                Ok(ScriptOutcome::Pass)
            } else {
                Ok(ScriptOutcome::Fail)
            }
        }
        Err(_) => match child.kill().await {
            Ok(()) => Ok(ScriptOutcome::Timeout),
            Err(e) => {
                warn!("unable to kill script {path} after deadline: {e}");
                Ok(ScriptOutcome::Fail)
            }
        },
    }
}

/// The `test` protocol: `resource` names the script to run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptProbe;

#[async_trait]
impl Probe for ScriptProbe {
    async fn probe(&self, job: &Job) -> anyhow::Result<Option<ResultValue>> {
        let outcome = run_script(&job.resource, script_deadline(job.frequency)).await?;
        Ok(Some(ResultValue::Text(outcome.as_str().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn script(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{body}").unwrap();
        file
    }

    #[test]
    fn deadline_is_one_second_short_of_the_period() {
        assert_eq!(script_deadline(5), Duration::from_secs(4));
        assert_eq!(script_deadline(1), Duration::from_secs(1));
        assert_eq!(script_deadline(0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_exit_passes() {
        let file = script("exit 0");
        let outcome = run_script(file.path().to_str().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Pass);
    }

    #[tokio::test]
    async fn non_zero_exit_fails() {
        let file = script("echo noise; exit 3");
        let outcome = run_script(file.path().to_str().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Fail);
    }

    #[tokio::test]
    async fn overrunning_script_times_out() {
        let file = script("sleep 10");
        let outcome = run_script(file.path().to_str().unwrap(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Timeout);
    }

    #[tokio::test]
    async fn probe_reports_outcome_as_text() {
        let file = script("exit 0");
        let job = Job {
            id: 1,
            address: "localhost".into(),
            protocol: crate::Protocol::Test,
            frequency: 3,
            domain: String::new(),
            resource: file.path().to_string_lossy().to_string(),
            segment: "default".into(),
        };

        let value = ScriptProbe.probe(&job).await.unwrap();
        assert_eq!(value, Some(ResultValue::Text("pass".into())));
    }
}

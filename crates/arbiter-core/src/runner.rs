//! Phase executor backed by an external command.

use crate::phase::{PhaseExecutor, PhaseOutcome};
use arbiter_domain::{ChangeEvent, Coverage, PhaseError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Runs a command with the batch's file set appended as arguments.
///
/// Exit status 0 means the phase passed. On failure every non-empty stderr
/// line becomes a [`PhaseError`]; lines shaped like `file:line: message` are
/// attributed to that file. If the last stdout line is a JSON object with a
/// `coverage` field it is used as the phase coverage.
///
/// The child is killed if the execution future is dropped, so a phase
/// timeout in the scheduler does not leave it running.
#[derive(Debug, Clone)]
pub struct CommandPhase {
    command: Vec<String>,
}

impl CommandPhase {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

#[async_trait]
impl PhaseExecutor for CommandPhase {
    async fn execute(
        &self,
        phase: &str,
        files: &[String],
        _changes: &[ChangeEvent],
    ) -> anyhow::Result<PhaseOutcome> {
        if self.command.is_empty() {
            anyhow::bail!("Phase {} has empty command", phase);
        }

        let exe = &self.command[0];
        let args = &self.command[1..];

        let output = Command::new(exe)
            .args(args)
            .args(files)
            .env("ARBITER_PHASE", phase)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Phase {} failed to spawn {}: {}", phase, exe, e))?
            .wait_with_output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let ok = output.status.success();

        let coverage = reported_coverage(&stdout).unwrap_or(if ok {
            Coverage::full()
        } else {
            Coverage::zero()
        });

        if ok {
            return Ok(PhaseOutcome::passed(coverage));
        }

        let mut errors: Vec<PhaseError> = stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(parse_error_line)
            .collect();
        if errors.is_empty() {
            let exit_code = output.status.code().unwrap_or(-1);
            errors.push(PhaseError::system(format!(
                "Phase '{}' exited with code {}",
                phase, exit_code
            )));
        }

        Ok(PhaseOutcome::failed(coverage, errors))
    }
}

fn reported_coverage(stdout: &str) -> Option<Coverage> {
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let value: serde_json::Value = serde_json::from_str(last.trim()).ok()?;
    let coverage = value.get("coverage")?;
    serde_json::from_value::<Coverage>(coverage.clone())
        .ok()
        .map(Coverage::clamped)
}

/// Parse `file:line: message`, falling back to a `system` error.
fn parse_error_line(line: &str) -> PhaseError {
    let mut parts = line.splitn(3, ':');
    if let (Some(file), Some(line_no), Some(message)) = (parts.next(), parts.next(), parts.next()) {
        if let Ok(line_no) = line_no.trim().parse::<u32>() {
            if !file.trim().is_empty() {
                return PhaseError::new(file.trim(), message.trim()).at_line(line_no);
            }
        }
    }
    PhaseError::system(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandPhase {
        CommandPhase::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_parse_error_line_with_location() {
        let err = parse_error_line("schemas/app.cue:12: field not allowed");
        assert_eq!(err.file, "schemas/app.cue");
        assert_eq!(err.line, Some(12));
        assert_eq!(err.message, "field not allowed");
    }

    #[test]
    fn test_parse_error_line_without_location() {
        let err = parse_error_line("fatal: something broke");
        assert_eq!(err.file, "system");
        assert_eq!(err.line, None);
        assert_eq!(err.message, "fatal: something broke");
    }

    #[test]
    fn test_reported_coverage_uses_last_line() {
        let stdout = "checking...\n{\"coverage\":{\"contracts\":0.5,\"scenarios\":1,\"ui\":0,\"budgets\":2}}\n";
        let coverage = reported_coverage(stdout).unwrap();
        assert_eq!(coverage.contracts, 0.5);
        assert_eq!(coverage.budgets, 1.0);
        assert!(reported_coverage("all good\n").is_none());
    }

    #[tokio::test]
    async fn test_execute_passing_command() {
        let outcome = sh("exit 0").execute("validate", &[], &[]).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.coverage, Coverage::full());
    }

    #[tokio::test]
    async fn test_execute_receives_files_as_arguments() {
        // `sh -c script name args...`: $0 is the first file, $1 the second.
        let phase = sh("test \"$0\" = a.cue && test \"$1\" = b.cue");
        let files = vec!["a.cue".to_string(), "b.cue".to_string()];
        let outcome = phase.execute("validate", &files, &[]).await.unwrap();
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn test_execute_failing_command_collects_stderr() {
        let phase = sh("echo 'app.cue:3: bad value' >&2; echo 'oops' >&2; exit 1");
        let outcome = phase.execute("validate", &[], &[]).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].file, "app.cue");
        assert_eq!(outcome.errors[0].line, Some(3));
        assert_eq!(outcome.errors[1].file, "system");
    }

    #[tokio::test]
    async fn test_execute_silent_failure_reports_exit_code() {
        let outcome = sh("exit 3").execute("ui", &[], &[]).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.errors[0].message.contains("code 3"));
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let phase = CommandPhase::new(vec![]);
        assert!(phase.execute("validate", &[], &[]).await.is_err());
    }
}

use std::path::Path;

use crate::sink::{FailureCode, Verdict};
use crate::worker::executor::{ExecStatus, ExecutionResult};

/// File a judge script (or the bundled parser) writes its score to.
pub const SCORE_FILE: &str = "score.txt";

/// Turn an execution into a verdict.
///
/// The score file in the working directory wins; otherwise the score is read
/// from the script output. A script that ran to completion but printed no
/// number scores zero.
pub async fn grade(result: &ExecutionResult, workdir: Option<&Path>) -> Verdict {
    match result.status {
        ExecStatus::TimedOut => return Verdict::Failed(FailureCode::Timeout),
        ExecStatus::LaunchFailed => return Verdict::Failed(FailureCode::System),
        ExecStatus::Succeeded | ExecStatus::Failed => {}
    }

    if let Some(dir) = workdir {
        if let Some(score) = read_score_file(dir).await {
            return Verdict::Scored(score);
        }
    }

    Verdict::Scored(extract_score(&result.output).unwrap_or(0.0))
}

async fn read_score_file(dir: &Path) -> Option<f64> {
    let contents = tokio::fs::read_to_string(dir.join(SCORE_FILE)).await.ok()?;
    contents.trim().parse().ok()
}

/// First number on the first output line that has one and is not an `OK`
/// status line.
pub fn extract_score(output: &str) -> Option<f64> {
    output
        .lines()
        .filter(|line| !line.contains("OK"))
        .find_map(first_number)
}

fn first_number(line: &str) -> Option<f64> {
    line.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .filter(|token| token.chars().any(|c| c.is_ascii_digit()))
        .find_map(|token| token.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(status: ExecStatus, output: &str) -> ExecutionResult {
        ExecutionResult {
            slot: 0,
            status,
            exit_code: None,
            output: output.to_string(),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn extract_skips_ok_lines() {
        let out = "[  OK  ] 3 tests\nScore: 72.5\n";
        assert_eq!(extract_score(out), Some(72.5));
    }

    #[test]
    fn extract_skips_lines_without_numbers() {
        assert_eq!(extract_score("building...\ndone\n90\n"), Some(90.0));
        assert_eq!(extract_score("no digits here"), None);
    }

    #[test]
    fn extract_handles_negative_and_embedded() {
        assert_eq!(extract_score("total=-1"), Some(-1.0));
        assert_eq!(extract_score("passed 8/10"), Some(8.0));
    }

    #[tokio::test]
    async fn timeout_and_launch_failures_are_not_scored() {
        assert_eq!(
            grade(&result(ExecStatus::TimedOut, "50"), None).await,
            Verdict::Failed(FailureCode::Timeout)
        );
        assert_eq!(
            grade(&result(ExecStatus::LaunchFailed, "50"), None).await,
            Verdict::Failed(FailureCode::System)
        );
    }

    #[tokio::test]
    async fn score_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SCORE_FILE), "88.00\n").unwrap();

        let verdict = grade(&result(ExecStatus::Succeeded, "12"), Some(dir.path())).await;
        assert_eq!(verdict, Verdict::Scored(88.0));
    }

    #[tokio::test]
    async fn nonzero_exit_still_scores_output() {
        let verdict = grade(&result(ExecStatus::Failed, "tests failed\n40\n"), None).await;
        assert_eq!(verdict, Verdict::Scored(40.0));
    }
}

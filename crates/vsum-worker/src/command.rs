//! Stage executors backed by external programs.
//!
//! Each program receives a JSON document on stdin and answers with a JSON
//! document on stdout. A non-zero exit status is a stage failure; stderr is
//! used as the failure message. Programs are killed when they outlive the
//! configured timeout.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use vsum_models::{Artifact, KeyframeCandidate, StageOutcome, StageOutput};
use vsum_pipeline::{
    AnalysisRequest, FrameExtractor, JobContext, KeyframeAnalysis, KeyframeAnalyzer, StageError,
    StageExecutor,
};

/// Maximum stderr characters carried into a failure message.
const MAX_ERROR_CHARS: usize = 500;

/// Program plus arguments, parsed from a whitespace-separated command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Parse a command line. Arguments are split on whitespace; no quoting.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Run the program with `input` on stdin and parse stdout as `O`.
    pub async fn run_json<I, O>(&self, input: &I, timeout: Duration) -> Result<O, StageError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let payload = serde_json::to_vec(input).map_err(|e| StageError::failed(e.to_string()))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::failed(format!("Failed to run {}: {}", self.program, e)))?;

        // Input is fed while output is collected, so neither pipe can fill up
        // and stall the other. Both count against the timeout.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&payload).await {
                    // A program may exit without reading its input
                    Err(e) if e.kind() != ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };
        let run = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.and(output)
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(program = %self.program, "Stage program timed out");
                return Err(StageError::Timeout(timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            let message: String = if message.is_empty() {
                format!("{} exited with status {:?}", self.program, output.status.code())
            } else {
                message.chars().take(MAX_ERROR_CHARS).collect()
            };
            return Err(StageError::Failed(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(program = %self.program, bytes = output.stdout.len(), "Stage program finished");
        serde_json::from_str(stdout.trim()).map_err(|e| StageError::invalid_output(e.to_string()))
    }
}

/// Runs one stage as an external program.
///
/// stdin: the `JobContext`; stdout: a `StageOutput`.
pub struct CommandStageExecutor {
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandStageExecutor {
    pub fn new(spec: CommandSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, ctx: &JobContext) -> StageOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&ctx.work_dir).await {
            return StageError::from(e).into();
        }
        match self.spec.run_json::<_, StageOutput>(ctx, self.timeout).await {
            Ok(output) => StageOutcome::Success(output),
            Err(e) => e.into(),
        }
    }
}

/// Keyframe analyzer backed by an external program.
///
/// stdin: the `AnalysisRequest`; stdout: a `KeyframeAnalysis`.
pub struct CommandKeyframeAnalyzer {
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandKeyframeAnalyzer {
    pub fn new(spec: CommandSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }
}

#[async_trait]
impl KeyframeAnalyzer for CommandKeyframeAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<KeyframeAnalysis, StageError> {
        self.spec.run_json(request, self.timeout).await
    }
}

#[derive(Serialize)]
struct ExtractionInput<'a> {
    context: &'a JobContext,
    keyframes: &'a [KeyframeCandidate],
}

/// Frame extractor backed by an external program.
///
/// stdin: `{context, keyframes}`; stdout: the list of produced artifacts.
pub struct CommandFrameExtractor {
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandFrameExtractor {
    pub fn new(spec: CommandSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }
}

#[async_trait]
impl FrameExtractor for CommandFrameExtractor {
    async fn extract(
        &self,
        ctx: &JobContext,
        keyframes: &[KeyframeCandidate],
    ) -> Result<Vec<Artifact>, StageError> {
        let input = ExtractionInput {
            context: ctx,
            keyframes,
        };
        self.spec.run_json(&input, self.timeout).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use vsum_models::{CorrelationToken, JobId, ProcessingJob, Stage};

    use super::*;

    fn context(work_dir: &Path) -> JobContext {
        let job = ProcessingJob::new(
            JobId::from_string("video-1"),
            "alice",
            "https://example.com/v.mp4",
            CorrelationToken::parse("tok-1").unwrap(),
        );
        JobContext::new(&job, Stage::ExtractingTranscript, work_dir.join("video-1"))
    }

    fn script(dir: &Path, body: &str) -> CommandSpec {
        let path = dir.join("stage.sh");
        std::fs::write(&path, body).unwrap();
        CommandSpec::parse(&format!("sh {}", path.display())).unwrap()
    }

    #[test]
    fn test_parse_command_line() {
        assert_eq!(
            CommandSpec::parse("  python3 stages/transcript.py --lang en "),
            Some(CommandSpec {
                program: "python3".into(),
                args: vec!["stages/transcript.py".into(), "--lang".into(), "en".into()],
            })
        );
        assert_eq!(CommandSpec::parse("   "), None);
    }

    #[tokio::test]
    async fn test_successful_program_output() {
        let dir = tempfile::tempdir().unwrap();
        let spec = script(
            dir.path(),
            "cat > /dev/null\necho '{\"progress_delta\": 20, \"next_step\": \"Analyzing video\", \"artifacts\": [{\"kind\": \"transcript\", \"uri\": \"t.json\"}]}'\n",
        );
        let executor = CommandStageExecutor::new(spec, Duration::from_secs(10));

        match executor.execute(&context(dir.path())).await {
            StageOutcome::Success(output) => {
                assert_eq!(output.progress_delta, 20);
                assert_eq!(output.artifacts.len(), 1);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert!(dir.path().join("video-1").is_dir());
    }

    #[tokio::test]
    async fn test_program_receives_context_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let spec = script(dir.path(), "cat\n");
        let echoed: serde_json::Value = spec
            .run_json(&context(dir.path()), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(echoed["job_id"], "video-1");
        assert_eq!(echoed["stage"], "extracting_transcript");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = script(dir.path(), "echo 'captions disabled' >&2\nexit 3\n");
        let executor = CommandStageExecutor::new(spec, Duration::from_secs(10));

        match executor.execute(&context(dir.path())).await {
            StageOutcome::Failure(f) => assert_eq!(f.message, "captions disabled"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_output_is_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = script(dir.path(), "echo 'not json'\n");
        let executor = CommandStageExecutor::new(spec, Duration::from_secs(10));
        assert!(!executor.execute(&context(dir.path())).await.is_success());
    }

    #[tokio::test]
    async fn test_slow_program_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let spec = script(dir.path(), "sleep 5\n");
        let err = spec
            .run_json::<_, serde_json::Value>(&context(dir.path()), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_program_ignoring_large_input_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let spec = script(dir.path(), "sleep 5\n");
        let payload = "x".repeat(1 << 20);
        let err = spec
            .run_json::<_, serde_json::Value>(&payload, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_large_input_echoed_back() {
        let dir = tempfile::tempdir().unwrap();
        let spec = script(dir.path(), "cat\n");
        let payload = "x".repeat(1 << 20);
        let echoed: String = spec
            .run_json(&payload, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(echoed.len(), payload.len());
    }

    #[tokio::test]
    async fn test_missing_program_is_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::parse("/nonexistent/stage-program").unwrap();
        let executor = CommandStageExecutor::new(spec, Duration::from_secs(1));
        assert!(!executor.execute(&context(dir.path())).await.is_success());
    }
}

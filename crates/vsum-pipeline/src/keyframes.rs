//! Keyframe stage: AI analysis followed by frame extraction.
//!
//! The analyzer proposes candidate moments, either from the transcript
//! produced by the previous stage or from the media itself. Candidates always
//! pass through `validate_keyframe_intervals` before any frame is extracted.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use vsum_models::{
    validate_keyframe_intervals, Artifact, JobId, KeyframeCandidate, StageOutcome, StageOutput,
};

use crate::config::AnalysisMode;
use crate::stage::{JobContext, StageError, StageExecutor};

/// Progress earned by the keyframe stage.
const KEYFRAME_PROGRESS: u8 = 40;

/// File name of the validated keyframe plan inside the job work dir.
const PLAN_FILE: &str = "keyframes.json";

/// Input handed to a keyframe analyzer.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub video_url: String,
    pub mode: AnalysisMode,
    /// Transcript artifact; always present in transcript mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Artifact>,
}

/// Analyzer response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyframeAnalysis {
    /// Duration of the analyzed video in seconds
    pub video_duration: f64,
    pub candidates: Vec<KeyframeCandidate>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Proposes keyframe candidates for a video.
#[async_trait]
pub trait KeyframeAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<KeyframeAnalysis, StageError>;
}

/// Extracts image frames at validated timestamps.
///
/// Re-running for the same job must overwrite, not duplicate, its frames.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(
        &self,
        ctx: &JobContext,
        keyframes: &[KeyframeCandidate],
    ) -> Result<Vec<Artifact>, StageError>;
}

/// Stage executor for `ExtractingKeyframes`.
pub struct KeyframeStage {
    analyzer: Arc<dyn KeyframeAnalyzer>,
    extractor: Arc<dyn FrameExtractor>,
    mode: AnalysisMode,
    min_gap_secs: f64,
}

impl KeyframeStage {
    pub fn new(
        analyzer: Arc<dyn KeyframeAnalyzer>,
        extractor: Arc<dyn FrameExtractor>,
        mode: AnalysisMode,
        min_gap_secs: f64,
    ) -> Self {
        Self {
            analyzer,
            extractor,
            mode,
            min_gap_secs,
        }
    }

    async fn run(&self, ctx: &JobContext) -> Result<StageOutput, StageError> {
        let transcript = ctx.artifact("transcript").cloned();
        if self.mode == AnalysisMode::Transcript && transcript.is_none() {
            return Err(StageError::failed(
                "Transcript-grounded analysis requires a transcript artifact",
            ));
        }

        let request = AnalysisRequest {
            job_id: ctx.job_id.clone(),
            video_url: ctx.video_url.clone(),
            mode: self.mode,
            transcript,
        };
        let analysis = self.analyzer.analyze(&request).await?;

        if !analysis.video_duration.is_finite() || analysis.video_duration <= 0.0 {
            return Err(StageError::invalid_output(format!(
                "video duration {} is not positive",
                analysis.video_duration
            )));
        }

        let proposed = analysis.candidates.len();
        let keyframes =
            validate_keyframe_intervals(analysis.candidates, analysis.video_duration, self.min_gap_secs);
        debug!(
            job_id = %ctx.job_id,
            mode = %self.mode,
            proposed,
            kept = keyframes.len(),
            "Validated keyframe candidates"
        );

        let mut output = StageOutput::new(KEYFRAME_PROGRESS, "Uploading assets");
        output.warnings = analysis.warnings;

        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let plan_path = ctx.work_dir.join(PLAN_FILE);
        let plan = serde_json::json!({
            "mode": self.mode.as_str(),
            "videoDuration": analysis.video_duration,
            "keyframes": &keyframes,
        });
        let plan = serde_json::to_vec_pretty(&plan).map_err(|e| StageError::failed(e.to_string()))?;
        tokio::fs::write(&plan_path, plan).await?;
        output.artifacts.push(
            Artifact::new("keyframe_plan", plan_path.to_string_lossy())
                .with_metadata(serde_json::json!({ "count": keyframes.len() })),
        );

        if keyframes.is_empty() {
            output
                .warnings
                .push("No keyframes passed validation; the summary will have no images".to_string());
            return Ok(output);
        }

        let frames = self.extractor.extract(ctx, &keyframes).await?;
        output.artifacts.extend(frames);
        Ok(output)
    }
}

#[async_trait]
impl StageExecutor for KeyframeStage {
    async fn execute(&self, ctx: &JobContext) -> StageOutcome {
        match self.run(ctx).await {
            Ok(output) => StageOutcome::Success(output),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use vsum_models::{CorrelationToken, ProcessingJob, Stage};

    use super::*;

    struct FixedAnalyzer {
        result: Result<KeyframeAnalysis, String>,
        seen: Mutex<Vec<AnalysisRequest>>,
    }

    impl FixedAnalyzer {
        fn new(timestamps: &[f64], duration: f64) -> Self {
            Self {
                result: Ok(KeyframeAnalysis {
                    video_duration: duration,
                    candidates: timestamps
                        .iter()
                        .map(|t| KeyframeCandidate::new(*t, "moment"))
                        .collect(),
                    warnings: Vec::new(),
                }),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                result: Err(message.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl KeyframeAnalyzer for FixedAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<KeyframeAnalysis, StageError> {
            self.seen.lock().unwrap().push(request.clone());
            self.result.clone().map_err(StageError::Failed)
        }
    }

    #[derive(Default)]
    struct RecordingExtractor {
        calls: Mutex<Vec<Vec<f64>>>,
    }

    #[async_trait]
    impl FrameExtractor for RecordingExtractor {
        async fn extract(
            &self,
            ctx: &JobContext,
            keyframes: &[KeyframeCandidate],
        ) -> Result<Vec<Artifact>, StageError> {
            self.calls
                .lock()
                .unwrap()
                .push(keyframes.iter().map(|k| k.timestamp).collect());
            Ok(keyframes
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    Artifact::new(
                        "keyframe",
                        ctx.work_dir.join(format!("frame_{:03}.jpg", i)).to_string_lossy(),
                    )
                })
                .collect())
        }
    }

    fn context(work_dir: &Path, with_transcript: bool) -> JobContext {
        let mut job = ProcessingJob::new(
            JobId::from_string("video-1"),
            "alice",
            "https://example.com/v.mp4",
            CorrelationToken::parse("tok-1").unwrap(),
        );
        if with_transcript {
            job.record_artifacts(
                Stage::ExtractingTranscript,
                vec![Artifact::new("transcript", "/tmp/t.json")],
            );
        }
        JobContext::new(&job, Stage::ExtractingKeyframes, work_dir.to_path_buf())
    }

    fn stage(
        analyzer: Arc<FixedAnalyzer>,
        extractor: Arc<RecordingExtractor>,
        mode: AnalysisMode,
    ) -> KeyframeStage {
        KeyframeStage::new(analyzer, extractor, mode, 30.0)
    }

    #[tokio::test]
    async fn test_only_validated_keyframes_are_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = Arc::new(FixedAnalyzer::new(&[300.0, 50.0, -5.0, 120.0, 0.0, 30.0], 250.0));
        let extractor = Arc::new(RecordingExtractor::default());
        let stage = stage(analyzer.clone(), extractor.clone(), AnalysisMode::Transcript);

        let output = match stage.execute(&context(dir.path(), true)).await {
            StageOutcome::Success(output) => output,
            other => panic!("expected success, got {:?}", other),
        };

        assert_eq!(*extractor.calls.lock().unwrap(), vec![vec![0.0, 30.0, 120.0]]);
        assert_eq!(output.artifacts.iter().filter(|a| a.kind == "keyframe").count(), 3);
        assert!(dir.path().join(PLAN_FILE).exists());

        let seen = analyzer.seen.lock().unwrap();
        assert_eq!(seen[0].mode, AnalysisMode::Transcript);
        assert!(seen[0].transcript.is_some());
    }

    #[tokio::test]
    async fn test_transcript_mode_requires_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = Arc::new(FixedAnalyzer::new(&[10.0], 60.0));
        let stage = stage(analyzer.clone(), Arc::default(), AnalysisMode::Transcript);

        let outcome = stage.execute(&context(dir.path(), false)).await;
        assert!(!outcome.is_success());
        assert!(analyzer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_media_mode_runs_without_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = Arc::new(FixedAnalyzer::new(&[10.0, 15.0, 70.0], 90.0));
        let extractor = Arc::new(RecordingExtractor::default());
        let stage = stage(analyzer.clone(), extractor.clone(), AnalysisMode::Media);

        assert!(stage.execute(&context(dir.path(), false)).await.is_success());
        assert_eq!(*extractor.calls.lock().unwrap(), vec![vec![10.0, 70.0]]);
        assert_eq!(analyzer.seen.lock().unwrap()[0].mode, AnalysisMode::Media);
    }

    #[tokio::test]
    async fn test_no_surviving_keyframes_warns_and_skips_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = Arc::new(FixedAnalyzer::new(&[-1.0, 500.0], 100.0));
        let extractor = Arc::new(RecordingExtractor::default());
        let stage = stage(analyzer, extractor.clone(), AnalysisMode::Media);

        let StageOutcome::Success(output) = stage.execute(&context(dir.path(), false)).await else {
            panic!("expected success");
        };
        assert_eq!(output.warnings.len(), 1);
        assert!(extractor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_analyzer_failure_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = Arc::new(FixedAnalyzer::failing("quota exceeded"));
        let stage = stage(analyzer, Arc::default(), AnalysisMode::Media);

        match stage.execute(&context(dir.path(), false)).await {
            StageOutcome::Failure(f) => assert_eq!(f.message, "quota exceeded"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_duration_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = Arc::new(FixedAnalyzer::new(&[1.0], 0.0));
        let stage = stage(analyzer, Arc::default(), AnalysisMode::Media);
        assert!(!stage.execute(&context(dir.path(), false)).await.is_success());
    }
}

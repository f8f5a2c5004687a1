//! Wiring of the production stage executors.

use std::sync::Arc;

use tracing::{info, warn};

use vsum_models::Stage;
use vsum_pipeline::{KeyframeStage, PipelineConfig, StageExecutor, StageRegistry};

use crate::command::{CommandFrameExtractor, CommandKeyframeAnalyzer, CommandSpec, CommandStageExecutor};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

fn spec(line: &Option<String>, var: &str) -> WorkerResult<Option<CommandSpec>> {
    match line {
        Some(line) => CommandSpec::parse(line)
            .map(Some)
            .ok_or_else(|| WorkerError::config_error(format!("{} is empty", var))),
        None => Ok(None),
    }
}

/// Build the stage registry from the configured stage programs.
///
/// Stages without a program are left unregistered and fail when dispatched.
pub fn build_registry(worker: &WorkerConfig, pipeline: &PipelineConfig) -> WorkerResult<StageRegistry> {
    let commands = &worker.commands;
    let timeout = worker.stage_timeout;
    let mut registry = StageRegistry::new();

    let simple = [
        (Stage::ExtractingTranscript, &commands.transcript, "STAGE_TRANSCRIPT_CMD"),
        (Stage::UploadingAssets, &commands.upload, "STAGE_UPLOAD_CMD"),
        (Stage::GeneratingSummary, &commands.summary, "STAGE_SUMMARY_CMD"),
    ];
    for (stage, line, var) in simple {
        if let Some(spec) = spec(line, var)? {
            let executor: Arc<dyn StageExecutor> = Arc::new(CommandStageExecutor::new(spec, timeout));
            registry = registry.register(stage, executor);
        }
    }

    let analysis = spec(&commands.analysis, "STAGE_ANALYSIS_CMD")?;
    let keyframes = spec(&commands.keyframes, "STAGE_KEYFRAMES_CMD")?;
    if let (Some(analysis), Some(keyframes)) = (analysis, keyframes) {
        let stage = KeyframeStage::new(
            Arc::new(CommandKeyframeAnalyzer::new(analysis, timeout)),
            Arc::new(CommandFrameExtractor::new(keyframes, timeout)),
            pipeline.analysis_mode,
            pipeline.keyframe_min_gap_secs,
        );
        registry = registry.register(Stage::ExtractingKeyframes, Arc::new(stage));
    }

    let missing = registry.missing();
    if missing.is_empty() {
        info!(mode = %pipeline.analysis_mode, "All stage executors configured");
    } else {
        warn!(?missing, "Stages without an executor will fail when dispatched");
    }

    Ok(registry)
}

//! Pipeline configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the keyframe stage analyzes a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Analysis grounded on the extracted transcript
    #[default]
    Transcript,
    /// Direct analysis of the media
    Media,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Transcript => "transcript",
            AnalysisMode::Media => "media",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transcript" => Ok(AnalysisMode::Transcript),
            "media" | "video" => Ok(AnalysisMode::Media),
            other => Err(format!("unknown analysis mode: {}", other)),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum explicit retries per job
    pub max_retries: u32,
    /// Root of per-job working directories
    pub work_dir: PathBuf,
    /// Keyframe analysis mode
    pub analysis_mode: AnalysisMode,
    /// Minimum spacing between kept keyframes
    pub keyframe_min_gap_secs: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            work_dir: PathBuf::from("/tmp/vsum"),
            analysis_mode: AnalysisMode::Transcript,
            keyframe_min_gap_secs: 20.0,
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_retries: std::env::var("PIPELINE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            work_dir: std::env::var("PIPELINE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/vsum")),
            analysis_mode: std::env::var("ANALYSIS_MODE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            keyframe_min_gap_secs: std::env::var("KEYFRAME_MIN_GAP_SECS")
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(20.0),
        }
    }

    /// Working directory of one job.
    pub fn job_work_dir(&self, job_id: &vsum_models::JobId) -> PathBuf {
        self.work_dir.join(job_id.as_str())
    }
}

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hex::encode as hex_encode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::model::{EncodingProfile, Event, Interval, Segment, Utterance};

use super::error::{PipelineError, PipelineResult};
use super::session::PipelineState;

#[derive(Debug, Clone, Serialize)]
pub struct ManifestSegment {
    #[serde(flatten)]
    pub segment: Segment,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestArtifact {
    pub path: PathBuf,
    pub url: String,
    pub sha256: String,
}

/// Record of one run, written as `manifest.json` in the session directory.
#[derive(Debug, Clone, Serialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub state: PipelineState,
    pub source: PathBuf,
    pub prepared_source: PathBuf,
    pub duration_seconds: f64,
    pub window_seconds: f64,
    pub encoding: EncodingProfile,
    pub intervals: Vec<Interval>,
    pub events: Vec<Event>,
    pub utterances: Vec<Utterance>,
    pub segments: Vec<ManifestSegment>,
    pub final_video: Option<ManifestArtifact>,
    pub warnings: usize,
    pub created_at: DateTime<Utc>,
}

pub async fn compute_sha256(path: &Path) -> PipelineResult<(String, u64)> {
    let bytes = fs::read(path).await.map_err(|source| PipelineError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((hex_encode(hasher.finalize()), bytes.len() as u64))
}

pub async fn manifest_segments(segments: &[Segment]) -> PipelineResult<Vec<ManifestSegment>> {
    let mut entries = Vec::with_capacity(segments.len());
    for segment in segments {
        let (sha256, bytes) = compute_sha256(&segment.path).await?;
        entries.push(ManifestSegment {
            segment: segment.clone(),
            sha256,
            bytes,
        });
    }
    Ok(entries)
}

pub async fn write_manifest(directory: &Path, manifest: &SessionManifest) -> PipelineResult<PathBuf> {
    let path = directory.join("manifest.json");
    fs::write(&path, serde_json::to_vec_pretty(manifest)?)
        .await
        .map_err(|source| PipelineError::Io {
            source,
            path: path.clone(),
        })?;
    Ok(path)
}

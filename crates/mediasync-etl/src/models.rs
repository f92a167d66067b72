//! Data carried between the pipeline stages

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything at or before this instant has been synchronized.
pub type Watermark = DateTime<Utc>;

/// Denormalized view of one video with its audio and video tracks.
///
/// Produced by the extractor for a single page and consumed by the
/// transformer; never stored.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ContentRow {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Page heading shown by the viewer.
    pub h1: String,
    /// Audio asset reference, relative to the media root.
    pub audio_file: Option<String>,
    /// Video asset reference, relative to the media root.
    pub video_file: Option<String>,
    /// The video record itself changed after the watermark.
    pub data_changed: bool,
    /// Either owned track changed after the watermark.
    pub track_changed: bool,
    /// Latest modification among the three records.
    pub max_date: Watermark,
}

/// Fields the web viewer reads back from the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSource {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub h1: String,
}

/// One document addressed to the search index.
///
/// `id` always equals `source.id`, which makes a re-delivered document an
/// overwrite instead of a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    #[serde(rename = "_id")]
    pub id: Uuid,
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_source")]
    pub source: DocumentSource,
}

impl SearchDocument {
    pub fn from_row(row: &ContentRow, index: &str) -> Self {
        Self {
            id: row.id,
            index: index.to_string(),
            source: DocumentSource {
                id: row.id,
                title: row.title.clone(),
                description: row.description.clone(),
                h1: row.h1.clone(),
            },
        }
    }
}

/// Remux one audio/video pair and package it for adaptive streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagingJob {
    pub content_id: Uuid,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    /// Intermediate container; removed once the manifest is written.
    pub container_path: PathBuf,
    pub manifest_path: PathBuf,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn ts(secs: i64) -> Watermark {
        Utc.timestamp_opt(1_650_000_000 + secs, 0).unwrap()
    }

    pub fn row(id: u128, data_changed: bool, track_changed: bool, at: i64) -> ContentRow {
        ContentRow {
            id: Uuid::from_u128(id),
            title: format!("Video {}", id),
            description: "description".to_string(),
            h1: "h1".to_string(),
            audio_file: Some(format!("audio/{}.aac", id)),
            video_file: Some(format!("video/{}.mp4", id)),
            data_changed,
            track_changed,
            max_date: ts(at),
        }
    }
}

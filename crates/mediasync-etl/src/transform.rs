//! Turns extracted rows into search documents and packaging jobs

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::{ContentRow, SearchDocument, Watermark};
use crate::packager::{MediaLayout, PackagingScheduler};

/// What one page produced.
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub documents: Vec<SearchDocument>,
    /// Latest modification time seen in the page, including rows that
    /// produced no document.
    pub max_timestamp: Option<Watermark>,
    pub jobs_scheduled: usize,
    /// Rows whose tracks changed but whose asset references are missing.
    pub missing_assets: usize,
}

pub struct Transformer {
    index: String,
    layout: MediaLayout,
    scheduler: Option<Arc<dyn PackagingScheduler>>,
}

impl Transformer {
    /// `scheduler` of `None` disables packaging entirely.
    pub fn new(index: impl Into<String>, layout: MediaLayout, scheduler: Option<Arc<dyn PackagingScheduler>>) -> Self {
        Self {
            index: index.into(),
            layout,
            scheduler,
        }
    }

    /// Process one page.
    ///
    /// A row yields a document only when its own record changed. A row with
    /// changed tracks schedules a packaging job and returns immediately.
    /// Duplicate ids within a page collapse to the last occurrence.
    pub fn transform(&self, rows: Vec<ContentRow>) -> TransformOutput {
        let mut output = TransformOutput::default();
        let mut positions: HashMap<uuid::Uuid, usize> = HashMap::with_capacity(rows.len());

        for row in rows {
            output.max_timestamp = Some(match output.max_timestamp {
                Some(current) => current.max(row.max_date),
                None => row.max_date,
            });

            if row.track_changed {
                self.schedule_packaging(&row, &mut output);
            }

            if !row.data_changed {
                continue;
            }

            let document = SearchDocument::from_row(&row, &self.index);
            match positions.get(&row.id) {
                Some(&pos) => output.documents[pos] = document,
                None => {
                    positions.insert(row.id, output.documents.len());
                    output.documents.push(document);
                },
            }
        }

        debug!(
            documents = output.documents.len(),
            jobs = output.jobs_scheduled,
            "Transformed page"
        );
        output
    }

    fn schedule_packaging(&self, row: &ContentRow, output: &mut TransformOutput) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };

        match (&row.video_file, &row.audio_file) {
            (Some(video), Some(audio)) => {
                scheduler.schedule(self.layout.job_for(row.id, video, audio));
                output.jobs_scheduled += 1;
            },
            _ => {
                warn!(
                    content_id = %row.id,
                    has_video = row.video_file.is_some(),
                    has_audio = row.audio_file.is_some(),
                    "Tracks changed but asset reference is missing, not packaging"
                );
                output.missing_assets += 1;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{row, ts};
    use crate::models::PackagingJob;
    use crate::packager::StreamFormat;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingScheduler {
        jobs: Mutex<Vec<PackagingJob>>,
    }

    impl PackagingScheduler for RecordingScheduler {
        fn schedule(&self, job: PackagingJob) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    fn layout() -> MediaLayout {
        MediaLayout {
            media_root: PathBuf::from("/media"),
            container_dir: PathBuf::from("/containers"),
            streams_dir: PathBuf::from("/streams"),
            format: StreamFormat::Dash,
        }
    }

    fn transformer() -> (Transformer, Arc<RecordingScheduler>) {
        let scheduler = Arc::new(RecordingScheduler::default());
        let t = Transformer::new("videos", layout(), Some(scheduler.clone() as Arc<dyn PackagingScheduler>));
        (t, scheduler)
    }

    #[test]
    fn test_data_change_yields_document_only() {
        let (t, scheduler) = transformer();
        let out = t.transform(vec![row(1, true, false, 5)]);

        assert_eq!(out.documents.len(), 1);
        assert_eq!(out.documents[0].id, Uuid::from_u128(1));
        assert_eq!(out.documents[0].index, "videos");
        assert_eq!(out.max_timestamp, Some(ts(5)));
        assert!(scheduler.jobs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_track_change_schedules_job_without_document() {
        let (t, scheduler) = transformer();
        let out = t.transform(vec![row(2, false, true, 9)]);

        assert!(out.documents.is_empty());
        assert_eq!(out.jobs_scheduled, 1);
        assert_eq!(out.max_timestamp, Some(ts(9)));

        let jobs = scheduler.jobs.lock().unwrap();
        assert_eq!(jobs[0].content_id, Uuid::from_u128(2));
        assert_eq!(jobs[0].video_path, PathBuf::from("/media/video/2.mp4"));
        assert_eq!(jobs[0].audio_path, PathBuf::from("/media/audio/2.aac"));
    }

    #[test]
    fn test_both_changed_yields_document_and_job() {
        let (t, scheduler) = transformer();
        let out = t.transform(vec![row(3, true, true, 1)]);

        assert_eq!(out.documents.len(), 1);
        assert_eq!(scheduler.jobs.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_max_timestamp_is_page_maximum() {
        let (t, _) = transformer();
        let out = t.transform(vec![row(1, true, false, 30), row(2, false, true, 50), row(3, true, false, 10)]);

        assert_eq!(out.max_timestamp, Some(ts(50)));
    }

    #[test]
    fn test_empty_page() {
        let (t, _) = transformer();
        let out = t.transform(Vec::new());

        assert!(out.documents.is_empty());
        assert_eq!(out.max_timestamp, None);
    }

    #[test]
    fn test_duplicate_ids_keep_last_in_first_position() {
        let (t, _) = transformer();
        let mut later = row(1, true, false, 20);
        later.title = "renamed".to_string();
        let out = t.transform(vec![row(1, true, false, 10), row(2, true, false, 15), later]);

        assert_eq!(out.documents.len(), 2);
        assert_eq!(out.documents[0].id, Uuid::from_u128(1));
        assert_eq!(out.documents[0].source.title, "renamed");
        assert_eq!(out.documents[1].id, Uuid::from_u128(2));
    }

    #[test]
    fn test_missing_asset_reference_still_advances_timestamp() {
        let (t, scheduler) = transformer();
        let mut r = row(4, false, true, 40);
        r.audio_file = None;
        let out = t.transform(vec![r]);

        assert_eq!(out.jobs_scheduled, 0);
        assert_eq!(out.missing_assets, 1);
        assert_eq!(out.max_timestamp, Some(ts(40)));
        assert!(scheduler.jobs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_packaging_disabled() {
        let t = Transformer::new("videos", layout(), None);
        let out = t.transform(vec![row(5, true, true, 1)]);

        assert_eq!(out.documents.len(), 1);
        assert_eq!(out.jobs_scheduled, 0);
    }
}

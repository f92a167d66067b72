//! Sync loop driver
//!
//! The loop scans every row changed after the stored watermark page by page.
//! Each page is transformed and loaded before the next one is requested, and
//! the offset always moves by the page size. When the database returns no
//! rows at all the pass is complete: the watermark moves to
//! the newest timestamp seen during the pass, the offset goes back to zero,
//! and the loop idles before scanning again.
//!
//! The watermark is only written at the end of a full pass, so a crash in
//! the middle of a pass repeats that pass on restart. Loads overwrite by id,
//! which makes the repeat harmless.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{EtlError, EtlResult};
use crate::extract::Extractor;
use crate::load::Loader;
use crate::models::Watermark;
use crate::state::{State, StateStorage};
use crate::transform::Transformer;

/// Result of one [`EtlProcess::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A page was processed and the offset moved past it.
    ///
    /// `rows` counts decoded rows, `dropped` the ones that failed to decode.
    Loaded {
        rows: usize,
        dropped: usize,
        indexed: usize,
        failed: usize,
        jobs: usize,
    },
    /// The pass finished. `watermark` is the value now in the store.
    Advanced { watermark: Watermark, changed: bool },
}

/// Position within the current pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub since: Watermark,
    pub offset: i64,
    /// Newest timestamp among pages loaded in this pass, dropped rows included.
    pub candidate: Option<Watermark>,
}

impl Cursor {
    fn start(since: Watermark) -> Self {
        Self {
            since,
            offset: 0,
            candidate: None,
        }
    }
}

pub struct EtlProcess<S> {
    extractor: Arc<dyn Extractor>,
    transformer: Transformer,
    loader: Arc<dyn Loader>,
    state: State<S>,
    settings: SyncConfig,
    cancel: CancellationToken,
    cursor: Option<Cursor>,
}

impl<S: StateStorage> EtlProcess<S> {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        transformer: Transformer,
        loader: Arc<dyn Loader>,
        state: State<S>,
        settings: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            extractor,
            transformer,
            loader,
            state,
            settings,
            cancel,
            cursor: None,
        }
    }

    pub fn state(&self) -> &State<S> {
        &self.state
    }

    /// Current scan position, `None` before the first step.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Watermark the first pass starts from.
    ///
    /// Falls back to the configured floor when the store is empty, unless a
    /// checkpoint is required. The floor is never written here.
    pub async fn initial_watermark(&self) -> EtlResult<Watermark> {
        match self.state.watermark().await? {
            Some(stored) => {
                info!(watermark = %stored, "Resuming from checkpoint");
                Ok(stored)
            },
            None if self.settings.require_checkpoint => Err(EtlError::MissingCheckpoint(
                "the state store holds no watermark".to_string(),
            )),
            None => {
                warn!(
                    floor = %self.settings.smallest_time,
                    "No checkpoint found, scanning from the floor watermark"
                );
                Ok(self.settings.smallest_time)
            },
        }
    }

    /// Perform exactly one transition: process a page, or finish the pass.
    ///
    /// On error the cursor is left where it was, so the same page is
    /// requested again by the next call.
    pub async fn step(&mut self) -> EtlResult<Step> {
        let mut cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => Cursor::start(self.initial_watermark().await?),
        };

        let result = self.advance(&mut cursor).await;
        self.cursor = Some(cursor);
        result
    }

    async fn advance(&self, cursor: &mut Cursor) -> EtlResult<Step> {
        let page = self
            .extractor
            .extract(cursor.since, self.settings.pack_size, cursor.offset)
            .await?;

        if page.is_exhausted() {
            return self.finish_pass(cursor).await;
        }

        let count = page.rows.len();
        let dropped = page.dropped();
        let output = self.transformer.transform(page.rows);
        let report = self.loader.load(&output.documents).await?;

        cursor.offset += self.settings.pack_size;
        for ts in output.max_timestamp.into_iter().chain(page.dropped_max_date) {
            cursor.candidate = Some(cursor.candidate.map_or(ts, |c| c.max(ts)));
        }

        info!(
            rows = count,
            dropped,
            documents = output.documents.len(),
            indexed = report.indexed,
            failed = report.failed,
            jobs = output.jobs_scheduled,
            offset = cursor.offset,
            "Page synchronized"
        );

        Ok(Step::Loaded {
            rows: count,
            dropped,
            indexed: report.indexed,
            failed: report.failed,
            jobs: output.jobs_scheduled,
        })
    }

    async fn finish_pass(&self, cursor: &mut Cursor) -> EtlResult<Step> {
        let stored = self.state.watermark().await?;

        let mut next = cursor.since;
        for ts in stored.into_iter().chain(cursor.candidate) {
            next = next.max(ts);
        }

        let changed = stored != Some(next);
        if changed {
            self.state.set_watermark(next).await?;
            info!(watermark = %next, scanned = cursor.offset, "Watermark advanced");
        } else {
            debug!(watermark = %next, "Pass complete, nothing new");
        }

        *cursor = Cursor::start(next);
        Ok(Step::Advanced { watermark: next, changed })
    }

    /// Sleep for the idle interval. Returns `false` if cancelled first.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.idle_interval()) => true,
        }
    }

    /// Run until cancelled.
    ///
    /// A failed cycle is logged and the pass restarts from the stored
    /// watermark after one idle period. A corrupt or required-but-missing
    /// checkpoint stops the loop.
    pub async fn run(&mut self) -> EtlResult<()> {
        info!(
            index = %self.settings.index_name,
            pack_size = self.settings.pack_size,
            idle_secs = self.settings.idle_secs,
            "Sync loop started"
        );

        let cancel = self.cancel.clone();
        while !cancel.is_cancelled() {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                step = self.step() => step,
            };

            match step {
                Ok(Step::Loaded { .. }) => continue,
                Ok(Step::Advanced { .. }) => {},
                Err(e @ (EtlError::StateCorrupt(_) | EtlError::MissingCheckpoint(_))) => {
                    error!(error = %e, "Checkpoint unusable, stopping");
                    return Err(e);
                },
                Err(e) => {
                    error!(error = %e, transient = e.is_transient(), "Sync cycle failed, restarting pass");
                    self.cursor = None;
                },
            }

            if !self.idle().await {
                break;
            }
        }

        info!("Sync loop stopped");
        Ok(())
    }
}

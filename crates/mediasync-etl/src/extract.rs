//! Paginated, watermark-filtered reads from the content database
//!
//! One page is a `LIMIT/OFFSET` slice of every video whose record, audio
//! track, or video track changed strictly after the watermark. Offsets are
//! stable only while nobody writes to those tables during a scan; concurrent
//! admin edits can shift rows between pages. Rows pushed back by such a
//! shift are picked up again on the next pass because the watermark only
//! advances after a full pass, but a row can still be seen twice.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EtlError, EtlResult};
use crate::models::{ContentRow, Watermark};
use crate::retry::RetryPolicy;

/// Query for one page of changed content.
///
/// `$1` is the watermark, `$2` the page size, `$3` the offset. Ordering by
/// `(max_date, id)` keeps page boundaries deterministic for a fixed data set.
pub const SELECT_CHANGED_CONTENT: &str = r#"
    SELECT
        v.id,
        v.title,
        v.description,
        v.h1,
        atr.audio_file,
        vtr.video_file,
        v.updated_at > $1 AS data_changed,
        COALESCE(atr.updated_at > $1, FALSE) OR COALESCE(vtr.updated_at > $1, FALSE) AS track_changed,
        GREATEST(v.updated_at, atr.updated_at, vtr.updated_at) AS max_date
    FROM content.video v
    LEFT JOIN content.audio_track atr ON atr.id = v.audio_track_id
    LEFT JOIN content.video_track vtr ON vtr.id = v.video_track_id
    WHERE
        v.updated_at > $1 OR
        atr.updated_at > $1 OR
        vtr.updated_at > $1
    ORDER BY max_date, v.id
    LIMIT $2 OFFSET $3
"#;

/// One page of the change scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Rows that decoded cleanly, in scan order.
    pub rows: Vec<ContentRow>,
    /// Rows the database returned, including undecodable ones.
    pub fetched: usize,
    /// Newest `max_date` among the undecodable rows that still had one.
    pub dropped_max_date: Option<Watermark>,
}

impl Page {
    /// A page where every fetched row decoded.
    pub fn from_rows(rows: Vec<ContentRow>) -> Self {
        Self {
            fetched: rows.len(),
            rows,
            dropped_max_date: None,
        }
    }

    /// The scan has run past the last changed row.
    pub fn is_exhausted(&self) -> bool {
        self.fetched == 0
    }

    pub fn dropped(&self) -> usize {
        self.fetched.saturating_sub(self.rows.len())
    }
}

/// Source of changed content rows.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetch rows changed after `since`, skipping `offset` rows.
    ///
    /// Only a page with nothing fetched ends the pass. A page whose rows all
    /// failed to decode is not empty.
    async fn extract(&self, since: Watermark, page_size: i64, offset: i64) -> EtlResult<Page>;
}

/// Reads pages from PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresExtractor {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresExtractor {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    async fn fetch_page(&self, since: Watermark, page_size: i64, offset: i64) -> EtlResult<Vec<PgRow>> {
        let rows = sqlx::query(SELECT_CHANGED_CONTENT)
            .bind(since)
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Extractor for PostgresExtractor {
    async fn extract(&self, since: Watermark, page_size: i64, offset: i64) -> EtlResult<Page> {
        // The whole page is fetched before decoding, so a connection failure
        // never yields a partial page.
        let raw = self
            .retry
            .run("extract page", || self.fetch_page(since, page_size, offset))
            .await?;

        let page = decode_rows(&raw);
        if page.dropped() > 0 {
            warn!(
                fetched = page.fetched,
                decoded = page.rows.len(),
                offset,
                "Dropped undecodable rows from page"
            );
        }

        debug!(rows = page.rows.len(), offset, since = %since, "Extracted page");
        Ok(page)
    }
}

/// Decode each row on its own so one malformed row does not sink the page.
fn decode_rows(raw: &[PgRow]) -> Page {
    let mut page = Page {
        rows: Vec::with_capacity(raw.len()),
        fetched: raw.len(),
        dropped_max_date: None,
    };

    for row in raw {
        match decode_row(row) {
            Ok(content) => page.rows.push(content),
            Err(e) => {
                let max_date = row.try_get::<Watermark, _>("max_date").ok();
                warn!(error = %e, max_date = ?max_date, "Skipping malformed content row");
                page.dropped_max_date = page.dropped_max_date.max(max_date);
            },
        }
    }
    page
}

fn decode_row(row: &PgRow) -> EtlResult<ContentRow> {
    ContentRow::from_row(row).map_err(|e| {
        let id = row
            .try_get::<Uuid, _>("id")
            .map_or_else(|_| "unknown id".to_string(), |id| id.to_string());
        EtlError::InvalidRow(format!("{}: {}", id, e))
    })
}

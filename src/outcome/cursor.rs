use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::store::{ts, OutcomeLog};
use super::OutcomeRecord;

const PAGE_SIZE: usize = 256;

/// Position in the (recorded_at, seq) order of the outcome log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub(crate) recorded_at: String,
    pub(crate) seq: i64,
}

impl Checkpoint {
    /// Position just before the first record written at `since`.
    pub fn before(since: DateTime<Utc>) -> Self {
        Self {
            recorded_at: ts(since),
            seq: -1,
        }
    }

    fn after(record: &OutcomeRecord) -> Self {
        Self {
            recorded_at: ts(record.recorded_at),
            seq: record.seq,
        }
    }
}

/// Lazy, restartable iterator over outcome records, oldest first.
///
/// Records are fetched a page at a time by keyset, so appends landing while
/// the cursor is open are picked up if they sort after its position, and no
/// lock is held between pages. A fetch error ends the sequence after being
/// yielded once.
pub struct OutcomeCursor<'a> {
    log: &'a OutcomeLog,
    position: Checkpoint,
    buffer: VecDeque<OutcomeRecord>,
    exhausted: bool,
}

impl<'a> OutcomeCursor<'a> {
    pub(crate) fn new(log: &'a OutcomeLog, position: Checkpoint) -> Self {
        Self {
            log,
            position,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Position after the last record yielded; pass it to
    /// [`OutcomeLog::resume`] to continue later.
    pub fn checkpoint(&self) -> Checkpoint {
        self.position.clone()
    }
}

impl Iterator for OutcomeCursor<'_> {
    type Item = anyhow::Result<OutcomeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.log.page_after(&self.position, PAGE_SIZE) {
                Ok(page) => {
                    if page.len() < PAGE_SIZE {
                        self.exhausted = true;
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let record = self.buffer.pop_front()?;
        self.position = Checkpoint::after(&record);
        Some(Ok(record))
    }
}

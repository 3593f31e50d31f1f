use chrono::Local;
use futures::future::join_all;
use tracing::Instrument;

use crate::browser::PageOpener;
use crate::error::Result;
use crate::result::{InputResult, Verdict};
use crate::session::{failed_record, run_session, SessionServices};
use crate::store::{SubmissionRecord, TargetRow, TargetSheet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub sessions: usize,
    pub succeeded: usize,
    /// Sessions whose guard caught an infrastructure error.
    pub failed: usize,
}

impl BatchSummary {
    fn add(&mut self, record: &SubmissionRecord) {
        self.sessions += 1;
        if record.verdict == Verdict::Success {
            self.succeeded += 1;
        }
        if record.input_result == InputResult::SessionFailed {
            self.failed += 1;
        }
    }
}

/// Run every pending target of the sheet. Each group finishes before the next starts.
pub async fn run_batch<O: PageOpener>(
    opener: &O,
    sheet: &dyn TargetSheet,
    services: &SessionServices,
) -> Result<BatchSummary> {
    let targets = sheet.targets().await?;
    let concurrency = services.config.tuning.concurrency.max(1);
    tracing::info!(targets = targets.len(), concurrency, "batch started");

    let mut summary = BatchSummary::default();
    for group in targets.chunks(concurrency) {
        let records = join_all(group.iter().map(|target| guarded(opener, target, services))).await;
        for (target, record) in group.iter().zip(records) {
            persist(sheet, services, target, &record).await;
            summary.add(&record);
        }
    }

    tracing::info!(
        sessions = summary.sessions,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "batch finished"
    );
    Ok(summary)
}

/// One session in its own tab and span. Never fails; errors become `SessionFailed`.
async fn guarded<O: PageOpener>(opener: &O, target: &TargetRow, services: &SessionServices) -> SubmissionRecord {
    let url = target.url.as_str();
    let span = tracing::info_span!("session", url);
    async move {
        let started_at = Local::now();
        let page = match opener.open().await {
            Ok(page) => page,
            Err(e) => {
                tracing::error!("tab could not be opened: {e}");
                return failed_record(url, &e, started_at);
            }
        };
        let outcome = run_session(&page, url, services).await;
        opener.release(page).await;
        match outcome {
            Ok(record) => {
                tracing::info!(verdict = ?record.verdict, marker = %record.marker, "session finished");
                record
            }
            Err(e) => {
                tracing::error!("session failed: {e}");
                failed_record(url, &e, started_at)
            }
        }
    }
    .instrument(span)
    .await
}

/// Exactly one audit record and one row update per session. Write failures only log.
async fn persist(sheet: &dyn TargetSheet, services: &SessionServices, target: &TargetRow, record: &SubmissionRecord) {
    if let Err(e) = services.store.save_submission(record).await {
        tracing::error!(url = %target.url, "audit record not saved: {e}");
    }
    let stamp = services.run.display_stamp();
    if let Err(e) = sheet
        .write_result(target.row, &record.marker, &stamp, record.image.as_deref())
        .await
    {
        tracing::error!(url = %target.url, row = target.row, "result row not written: {e}");
    }
}

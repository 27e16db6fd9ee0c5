use std::{
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use itertools::Itertools;
use tokio::{
    task::JoinHandle,
    time::{sleep, Instant},
};

use crate::{
    errors::{ErrorKind, ProcessError, SourceError},
    extractor::Extractor,
    retry::{extract_with_retry, RetryPolicy},
    session::{Session, SessionHandle, SessionRegistry, SessionStatus},
    source::UrlSource,
    store::{collapse_mappings, commit_with_retry, ImageStore, RecordStore},
    types::{
        BatchOutcome, HealthReport, ImageMapping, ProductRecord, SourceInfo, StatusReport,
        Summary,
    },
    utils::{index_range_label, new_session_id, rounded_secs, SAMPLE_URLS},
};

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct CoordinatorOptions {
    #[builder(default = "100")]
    max_urls_per_request: usize,
    #[builder(default = "20")]
    max_batch_size: usize,
    #[builder(default = "5")]
    default_batch_size: usize,
    // attempts per url, first one included
    #[builder(default = "3")]
    max_attempts: u32,
    #[builder(default = "1000")]
    retry_base_delay_ms: u64,
    // pause between two batches of the same session
    #[builder(default = "2000")]
    batch_delay_ms: u64,
    // wall clock budget of a whole session
    #[builder(default = "900_000")]
    session_timeout_ms: u64,
    #[builder(default = "3")]
    commit_attempts: usize,
    #[builder(default = "250")]
    commit_backoff_ms: u64,
}

impl CoordinatorOptions {
    pub fn default_builder() -> CoordinatorOptionsBuilder {
        CoordinatorOptionsBuilder::default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn default_batch_size(&self) -> usize {
        self.default_batch_size
    }
}

// aborts the worker when the batch it belongs to is dropped
struct WorkerGuard(JoinHandle<BatchOutcome>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Splits `start..=end` into contiguous chunks of `batch_size`, the last one
/// possibly shorter.
pub fn partition(start: usize, end: usize, batch_size: usize) -> Vec<RangeInclusive<usize>> {
    (start..=end)
        .chunks(batch_size.max(1))
        .into_iter()
        .filter_map(|mut chunk| {
            let first = chunk.next()?;
            let last = chunk.last().unwrap_or(first);
            Some(first..=last)
        })
        .collect()
}

pub struct BatchCoordinator {
    urls: Arc<dyn UrlSource>,
    extractor: Arc<dyn Extractor>,
    records: Arc<dyn RecordStore>,
    images: Arc<dyn ImageStore>,
    registry: Arc<SessionRegistry>,
    options: CoordinatorOptions,
    should_terminate: Arc<AtomicBool>,
}

impl BatchCoordinator {
    pub fn new(
        urls: Arc<dyn UrlSource>,
        extractor: Arc<dyn Extractor>,
        records: Arc<dyn RecordStore>,
        images: Arc<dyn ImageStore>,
        options: CoordinatorOptions,
    ) -> Self {
        BatchCoordinator {
            urls,
            extractor,
            records,
            images,
            registry: Arc::new(SessionRegistry::new()),
            options,
            should_terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Once the flag is raised no new batch is dispatched, like on timeout.
    pub fn with_termination_flag(mut self, should_terminate: Arc<AtomicBool>) -> Self {
        self.should_terminate = should_terminate;
        self
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub async fn info(&self) -> Result<SourceInfo, ProcessError> {
        let total = self.urls.len().await?;
        let sample_urls = self.urls.sample(SAMPLE_URLS).await?;
        Ok(SourceInfo {
            total_urls_available: total,
            index_range: index_range_label(total),
            sample_urls,
        })
    }

    pub fn status(&self) -> StatusReport {
        let sessions = self.registry.list();
        let active_sessions = sessions.iter().filter(|s| !s.status.is_terminal()).count();
        StatusReport {
            active_sessions,
            status: if active_sessions > 0 { "running" } else { "idle" }.into(),
            sessions,
        }
    }

    /// Liveness check: the url list must be readable.
    pub async fn health(&self) -> HealthReport {
        let active_sessions = self.registry.active_count();
        match self.urls.len().await {
            Ok(total) => HealthReport {
                status: "healthy".into(),
                total_urls_available: Some(total),
                active_sessions,
                error: None,
            },
            Err(e) => {
                error!("health check could not read the url list: {}", e);
                HealthReport {
                    status: "unhealthy".into(),
                    total_urls_available: None,
                    active_sessions,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn retire_finished(&self) -> usize {
        self.registry.retire_terminal()
    }

    fn validate(&self, start: usize, end: usize, batch_size: usize) -> Result<(), ProcessError> {
        if start > end {
            return Err(ProcessError::InvalidRange {
                start,
                end,
                available: "start_index must be <= end_index".into(),
            });
        }
        let requested = end - start + 1;
        if requested > self.options.max_urls_per_request {
            return Err(ProcessError::TooManyUrls {
                requested,
                max: self.options.max_urls_per_request,
            });
        }
        if batch_size < 1 || batch_size > self.options.max_batch_size {
            return Err(ProcessError::InvalidBatchSize {
                batch_size,
                max: self.options.max_batch_size,
            });
        }
        Ok(())
    }

    /// Processes the urls at `start_index..=end_index` as one session and
    /// commits what was extracted. Validation failures return before any
    /// session exists; everything after registration ends in a `Summary`.
    pub async fn process(
        &self,
        start_index: usize,
        end_index: usize,
        batch_size: Option<usize>,
        session_id: Option<String>,
    ) -> Result<Summary, ProcessError> {
        let started = Instant::now();
        let batch_size = batch_size.unwrap_or(self.options.default_batch_size);
        self.validate(start_index, end_index, batch_size)?;

        let total = self.urls.len().await?;
        if end_index >= total {
            return Err(ProcessError::InvalidRange {
                start: start_index,
                end: end_index,
                available: index_range_label(total),
            });
        }
        // the session works on this snapshot even if the list changes meanwhile
        let urls = self.urls.get_range(start_index, end_index).await?;
        if urls.len() != end_index - start_index + 1 {
            return Err(SourceError::OutOfBounds {
                start: start_index,
                end: end_index,
                len: start_index + urls.len(),
            }
            .into());
        }

        let session_id = session_id.unwrap_or_else(new_session_id);
        let handle = self.registry.register(Session::new(
            &session_id,
            start_index,
            end_index,
            batch_size,
        ))?;
        let _guard = handle.guard();

        info!(
            "[session {}] processing urls {}-{} ({} urls) in batches of {}",
            session_id,
            start_index,
            end_index,
            urls.len(),
            batch_size
        );

        let deadline = started + Duration::from_millis(self.options.session_timeout_ms);
        let chunks = partition(start_index, end_index, batch_size);
        let mut outcomes: Vec<BatchOutcome> = Vec::with_capacity(urls.len());
        let mut halted: Option<&'static str> = None;

        for (batch_num, chunk) in chunks.iter().enumerate() {
            if halted.is_none() {
                halted = self.halt_reason(deadline);
            }
            if let Some(reason) = halted {
                for index in chunk.clone() {
                    let outcome =
                        BatchOutcome::not_dispatched(index, &urls[index - start_index], reason);
                    handle.record(&outcome);
                    outcomes.push(outcome);
                }
                continue;
            }

            debug!(
                "[session {}] batch {}/{} covering {}-{}",
                session_id,
                batch_num + 1,
                chunks.len(),
                chunk.start(),
                chunk.end()
            );
            let batch = self
                .run_batch(&handle, chunk.clone(), &urls, start_index, batch_size)
                .await;
            outcomes.extend(batch);

            if batch_num + 1 < chunks.len() && self.options.batch_delay_ms > 0 {
                debug!(
                    "[session {}] waiting {}ms before next batch",
                    session_id, self.options.batch_delay_ms
                );
                sleep(Duration::from_millis(self.options.batch_delay_ms)).await;
            }
        }

        if let Some(reason) = halted {
            warn!("[session {}] stopped dispatching: {}", session_id, reason);
        }

        Ok(self.commit(&handle, outcomes, halted, started).await)
    }

    fn halt_reason(&self, deadline: Instant) -> Option<&'static str> {
        if self.should_terminate.load(Ordering::Relaxed) {
            return Some("termination requested");
        }
        if Instant::now() >= deadline {
            return Some("session timeout");
        }
        None
    }

    /// Runs one chunk with at most `concurrency` workers in flight. Each
    /// worker records its own outcome on the session handle.
    async fn run_batch(
        &self,
        handle: &SessionHandle,
        chunk: RangeInclusive<usize>,
        urls: &[String],
        offset: usize,
        concurrency: usize,
    ) -> Vec<BatchOutcome> {
        let policy = self.options.retry_policy();

        tokio_stream::iter(chunk.map(|index| (index, urls[index - offset].clone())))
            .map(|(index, url)| {
                let extractor = self.extractor.clone();
                let policy = policy.clone();
                let session = handle.clone();
                async move {
                    let mut worker = {
                        let url = url.clone();
                        let session = session.clone();
                        WorkerGuard(tokio::spawn(async move {
                            let outcome = extract_with_retry(
                                extractor.as_ref(),
                                &policy,
                                index,
                                &url,
                                session.id(),
                            )
                            .await;
                            session.record(&outcome);
                            outcome
                        }))
                    };
                    match (&mut worker.0).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!("[session {}] worker for {} died: {}", session.id(), url, e);
                            let outcome = BatchOutcome::failed(
                                index,
                                &url,
                                0,
                                ErrorKind::Permanent(format!("worker died: {}", e)),
                            );
                            session.record(&outcome);
                            outcome
                        }
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    /// One append for the records and one merge for the images of the whole
    /// session, then the session is closed.
    async fn commit(
        &self,
        handle: &SessionHandle,
        outcomes: Vec<BatchOutcome>,
        halted: Option<&'static str>,
        started: Instant,
    ) -> Summary {
        let session_id = handle.id().to_string();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o.error, Some(ErrorKind::NotDispatched(_))))
            .count();
        let mut records = vec![];
        let mut mappings = vec![];
        for outcome in outcomes {
            if let Some(r) = outcome.record {
                records.push(r);
            }
            if let Some(m) = outcome.images {
                mappings.push(m);
            }
        }
        let mappings = collapse_mappings(mappings);

        let mut persist_error: Option<String> = None;
        let record_store: &dyn RecordStore = self.records.as_ref();
        let image_store: &dyn ImageStore = self.images.as_ref();
        let record_batch: &[ProductRecord] = &records;
        let image_batch: &[ImageMapping] = &mappings;

        let records_persisted = records.is_empty()
            || match commit_with_retry(
                self.options.commit_attempts,
                self.options.commit_backoff_ms,
                "records",
                move || record_store.append(record_batch),
            )
            .await
            {
                Ok(_) => {
                    info!(
                        "[session {}] appended {} records",
                        session_id,
                        records.len()
                    );
                    true
                }
                Err(e) => {
                    error!(
                        "[session {}] could not persist {} records: {}",
                        session_id,
                        records.len(),
                        e
                    );
                    handle.record_persist_failure(records.len(), &format!("records: {}", e));
                    persist_error = Some(format!("records: {}", e));
                    false
                }
            };

        let images_persisted = mappings.is_empty()
            || match commit_with_retry(
                self.options.commit_attempts,
                self.options.commit_backoff_ms,
                "images",
                move || image_store.merge(image_batch),
            )
            .await
            {
                Ok(_) => {
                    info!(
                        "[session {}] merged image mappings for {} products",
                        session_id,
                        mappings.len()
                    );
                    true
                }
                Err(e) => {
                    error!(
                        "[session {}] could not merge image mappings: {}",
                        session_id, e
                    );
                    handle.record_persist_failure(0, &format!("images: {}", e));
                    let msg = format!("images: {}", e);
                    persist_error = Some(match persist_error {
                        Some(prev) => format!("{}; {}", prev, msg),
                        None => msg,
                    });
                    false
                }
            };

        let view = handle.snapshot();
        let all_failed = view.processed_count == 0;

        let (status, message) = if let Some(reason) = halted {
            (
                SessionStatus::Failed,
                format!(
                    "Stopped early ({}): {} of {} urls never dispatched",
                    reason, skipped, view.total_urls
                ),
            )
        } else if let Some(e) = &persist_error {
            (
                SessionStatus::Failed,
                format!("Extraction finished but persistence failed: {}", e),
            )
        } else if all_failed {
            (
                SessionStatus::Failed,
                format!(
                    "No products could be extracted from indices {}-{}",
                    view.start_index, view.end_index
                ),
            )
        } else {
            (
                SessionStatus::Completed,
                format!(
                    "Successfully processed indices {}-{}",
                    view.start_index, view.end_index
                ),
            )
        };
        handle.finish(status);

        let elapsed = started.elapsed();
        info!(
            "[session {}] {:?}: {} processed, {} failed in {:.2}s",
            session_id,
            status,
            view.processed_count,
            view.failed_count,
            elapsed.as_secs_f64()
        );

        Summary {
            success: status == SessionStatus::Completed,
            session_id,
            status,
            products_processed: view.processed_count,
            products_failed: view.failed_count,
            total_urls_in_range: view.total_urls,
            processing_time_seconds: rounded_secs(elapsed),
            records_persisted,
            images_persisted,
            persist_error,
            message,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partitions_into_contiguous_chunks() {
        assert_eq!(partition(0, 9, 5), vec![0..=4, 5..=9]);
        assert_eq!(partition(10, 19, 3), vec![10..=12, 13..=15, 16..=18, 19..=19]);
        assert_eq!(partition(7, 7, 20), vec![7..=7]);
        assert_eq!(partition(0, 4, 1).len(), 5);
    }

    #[test]
    fn options_defaults() {
        let o = CoordinatorOptions::default_builder().build().unwrap();
        assert_eq!(o.max_urls_per_request, 100);
        assert_eq!(o.max_batch_size, 20);
        assert_eq!(o.default_batch_size(), 5);
        let p = o.retry_policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.base_delay, Duration::from_secs(1));
    }
}

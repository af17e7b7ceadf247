//! Running OCR over every page of an [`ExtractionJob`].
//!
//! Pages are sent to a [`WorkerPool`] in batches of at most `degree` tasks.
//! Each batch is awaited in submission order before the next one starts, so
//! results are always folded in page order no matter which OCR process
//! finishes first.

pub mod aggregate;
pub mod engines;

use std::{sync::Arc, time::Duration};

use futures::{FutureExt as _, channel::oneshot};

use self::{
    aggregate::{AggregationMode, ExtractionResult, TextAggregator},
    engines::OcrEngine,
};
use super::work::{WorkFn, WorkerPool};
use crate::{
    cpu_limit::ConcurrencyDegree, job::ExtractionJob, prelude::*, text::clean_ocr_text,
    ui::ProgressReporter,
};

/// Options controlling how we extract and combine page text.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Clean up blank lines, form feeds and surrounding whitespace on each
    /// page.
    pub trim: bool,

    /// Return one string, or one entry per page?
    pub aggregation_mode: AggregationMode,

    /// Reduce the text to unique tokens.
    pub remove_duplicates: bool,

    /// Separate concatenated pages with a form feed.
    pub page_breaks: bool,

    /// Give up on any single page after this long, treating it as empty.
    pub page_timeout: Option<Duration>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            trim: true,
            aggregation_mode: AggregationMode::default(),
            remove_duplicates: false,
            page_breaks: false,
            page_timeout: None,
        }
    }
}

/// A page which has been handed to the worker pool.
struct OcrTask {
    page_idx: usize,
    /// `None` if we couldn't submit this page.
    rx: Option<oneshot::Receiver<Result<String>>>,
}

/// Drives OCR across all the pages of a job with bounded concurrency.
pub struct BatchScheduler {
    engine: Arc<dyn OcrEngine>,
    degree: ConcurrencyDegree,
    progress: Option<Arc<dyn ProgressReporter>>,
}

impl BatchScheduler {
    /// Create a new scheduler running at most `degree` OCR invocations at once.
    pub fn new(engine: Arc<dyn OcrEngine>, degree: ConcurrencyDegree) -> Self {
        Self {
            engine,
            degree,
            progress: None,
        }
    }

    /// Report progress after each page is folded into the result.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// OCR every page of `job` and combine the results.
    ///
    /// This never fails. Missing page images are skipped, and pages which
    /// can't be OCRed are treated as empty.
    #[instrument(
        level = "debug",
        skip_all,
        fields(run_id = %job.run_id(), pages = job.page_count(), degree = %self.degree)
    )]
    pub async fn run(&self, job: &ExtractionJob, options: &ExtractOptions) -> ExtractionResult {
        let total_pages = job.page_count();
        let mut aggregator = TextAggregator::new(options);
        if total_pages == 0 {
            warn!("No pages to OCR");
            return aggregator.finish();
        }

        let degree = self.degree.get();
        let pool = WorkerPool::new(degree, self.work_fn(options.page_timeout));
        let mut batch = Vec::with_capacity(degree);
        for (page_idx, image_path) in job.page_paths().iter().enumerate() {
            if !image_exists(image_path).await {
                debug!(page_idx, path = %image_path.display(), "Skipping missing page image");
                continue;
            }

            let rx = match pool.submit(image_path.clone()).await {
                Ok(rx) => Some(rx),
                Err(err) => {
                    warn!(page_idx, "Could not submit page for OCR: {:#}", err);
                    None
                }
            };
            batch.push(OcrTask { page_idx, rx });

            if batch.len() >= degree || page_idx + 1 == total_pages {
                self.drain(&mut batch, &mut aggregator, total_pages, options)
                    .await;
            }
        }
        // If the last page was missing, we may still have a partial batch.
        self.drain(&mut batch, &mut aggregator, total_pages, options)
            .await;

        if let Err(err) = pool.close().await {
            error!("Could not shut down OCR workers: {:#}", err);
        }

        let pages_folded = aggregator.pages_folded();
        let result = aggregator.finish();
        info!(
            pages_folded,
            word_count = result.word_count,
            success = result.success,
            "Finished OCR"
        );
        result
    }

    /// Build the function our workers run for each page.
    fn work_fn(&self, page_timeout: Option<Duration>) -> WorkFn<PathBuf, Result<String>> {
        let engine = self.engine.clone();
        Arc::new(move |image_path: PathBuf| {
            let engine = engine.clone();
            async move {
                let ocr = engine.ocr_image(&image_path);
                match page_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, ocr).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("OCR timed out after {:?}", timeout)),
                    },
                    None => ocr.await,
                }
            }
            .boxed()
        })
    }

    /// Wait for every task in `batch`, in order, and fold in its text.
    async fn drain(
        &self,
        batch: &mut Vec<OcrTask>,
        aggregator: &mut TextAggregator,
        total_pages: usize,
        options: &ExtractOptions,
    ) {
        for OcrTask { page_idx, rx } in batch.drain(..) {
            let text = match rx {
                Some(rx) => match rx.await {
                    Ok(Ok(text)) => text,
                    Ok(Err(err)) => {
                        warn!(page_idx, "Could not OCR page: {:#}", err);
                        String::new()
                    }
                    Err(_) => {
                        warn!(page_idx, "OCR worker went away");
                        String::new()
                    }
                },
                None => String::new(),
            };
            let text = if options.trim {
                clean_ocr_text(&text)
            } else {
                text
            };

            let completed_pages = aggregator.push_page(text);
            trace!(page_idx, completed_pages, "Folded page");
            if let Some(progress) = &self.progress {
                progress.report(total_pages, completed_pages);
            }
        }
    }
}

/// Does the image for a page exist right now?
async fn image_exists(path: &Path) -> bool {
    match tokio::fs::try_exists(path).await {
        Ok(exists) => exists,
        Err(err) => {
            warn!(path = %path.display(), "Could not check for page image: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::job::SourceKind;

    /// A shared, ordered record of what happened during a run.
    type EventLog = Arc<Mutex<Vec<String>>>;

    /// A fake OCR engine which "recognizes" the contents of text files.
    ///
    /// A page containing `FAIL` returns an error, and a page containing
    /// `SLEEP` takes far longer than any test timeout. Each call logs
    /// `start <text>` to `events`.
    #[derive(Default)]
    struct ScriptedOcrEngine {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        events: EventLog,
    }

    #[async_trait]
    impl OcrEngine for ScriptedOcrEngine {
        async fn ocr_image(&self, image_path: &Path) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let text = tokio::fs::read_to_string(image_path).await;
            if let Ok(text) = &text {
                self.events
                    .lock()
                    .expect("lock poisoned")
                    .push(format!("start {text}"));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let text = text?;
            match text.as_str() {
                "FAIL" => Err(anyhow!("tesseract exited with status 1")),
                "SLEEP" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok("too late".to_owned())
                }
                _ => Ok(text),
            }
        }
    }

    /// Build a job with one file per page. `None` pages have no file.
    fn job_with_pages(pages: &[Option<&str>]) -> Result<ExtractionJob> {
        let tmpdir = TempDir::with_prefix("scheduler-test")?;
        let mut page_paths = vec![];
        for (idx, page) in pages.iter().enumerate() {
            let path = tmpdir.path().join(format!("page-{idx}.txt"));
            if let Some(text) = page {
                std::fs::write(&path, text)?;
            }
            page_paths.push(path);
        }
        Ok(ExtractionJob::new(
            PathBuf::from("input.pdf"),
            Uuid::new_v4(),
            SourceKind::Document,
            page_paths,
        )
        .with_tmpdir(tmpdir))
    }

    fn per_page() -> ExtractOptions {
        ExtractOptions {
            aggregation_mode: AggregationMode::PerPage,
            ..ExtractOptions::default()
        }
    }

    /// A progress reporter which records each `(total, completed)` call.
    fn recording_progress() -> (Arc<Mutex<Vec<(usize, usize)>>>, Arc<dyn ProgressReporter>) {
        let calls = Arc::new(Mutex::new(vec![]));
        let progress: Arc<dyn ProgressReporter> = {
            let calls = calls.clone();
            Arc::new(move |total: usize, done: usize| {
                calls.lock().expect("lock poisoned").push((total, done));
            })
        };
        (calls, progress)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn zero_pages_never_invokes_engine() -> Result<()> {
        let engine = Arc::new(ScriptedOcrEngine::default());
        let scheduler = BatchScheduler::new(engine.clone(), ConcurrencyDegree::new(2));
        let job = job_with_pages(&[])?;
        let result = scheduler.run(&job, &ExtractOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.word_count, 0);
        assert_eq!(result.text.as_concatenated(), Some(""));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_pages_are_skipped_without_progress() -> Result<()> {
        let (calls, progress) = recording_progress();
        let engine = Arc::new(ScriptedOcrEngine::default());
        let scheduler = BatchScheduler::new(engine.clone(), ConcurrencyDegree::new(2))
            .with_progress(progress);
        let job = job_with_pages(&[Some("one"), None, Some("two three"), Some("four")])?;

        let result = scheduler.run(&job, &per_page()).await;
        assert_eq!(
            result.text.as_per_page(),
            Some(&strings(&["one", "two three", "four"])[..])
        );
        assert_eq!(result.word_count, 4);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *calls.lock().expect("lock poisoned"),
            vec![(4, 1), (4, 2), (4, 3)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn partial_batch_before_missing_last_page_is_drained() -> Result<()> {
        let engine = Arc::new(ScriptedOcrEngine::default());
        let scheduler = BatchScheduler::new(engine, ConcurrencyDegree::new(4));
        let job = job_with_pages(&[Some("alpha"), Some("beta"), None])?;
        let result = scheduler.run(&job, &per_page()).await;
        assert_eq!(
            result.text.as_per_page(),
            Some(&strings(&["alpha", "beta"])[..])
        );
        Ok(())
    }

    #[tokio::test]
    async fn concatenated_text_matches_joined_pages() -> Result<()> {
        let pages = [Some("Hello "), Some("big"), None, Some(" world")];
        let job = job_with_pages(&pages)?;
        let opts = ExtractOptions {
            trim: false,
            ..ExtractOptions::default()
        };
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedOcrEngine::default()),
            ConcurrencyDegree::new(3),
        );

        let concatenated = scheduler.run(&job, &opts).await;
        let per_page = scheduler
            .run(
                &job,
                &ExtractOptions {
                    aggregation_mode: AggregationMode::PerPage,
                    ..opts.clone()
                },
            )
            .await;

        let joined = per_page.text.as_per_page().map(|pages| pages.concat());
        assert_eq!(concatenated.text.as_concatenated(), joined.as_deref());
        assert_eq!(concatenated.text.as_concatenated(), Some("Hello big world"));
        assert_eq!(concatenated.word_count, per_page.word_count);
        Ok(())
    }

    #[tokio::test]
    async fn degree_does_not_change_the_result() -> Result<()> {
        let pages = (0..11)
            .map(|idx| format!("page {idx} has text number{idx}"))
            .collect::<Vec<_>>();
        let pages = pages.iter().map(|p| Some(p.as_str())).collect::<Vec<_>>();
        let job = job_with_pages(&pages)?;

        let mut results = vec![];
        for degree in [1, 2, 4, 16] {
            let scheduler = BatchScheduler::new(
                Arc::new(ScriptedOcrEngine::default()),
                ConcurrencyDegree::new(degree),
            );
            results.push(scheduler.run(&job, &ExtractOptions::default()).await);
        }
        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
        assert_eq!(results[0].word_count, 44);
        Ok(())
    }

    #[tokio::test]
    async fn never_exceeds_degree_in_flight() -> Result<()> {
        let pages = vec![Some("words"); 9];
        let job = job_with_pages(&pages)?;
        let engine = Arc::new(ScriptedOcrEngine::default());
        let scheduler = BatchScheduler::new(engine.clone(), ConcurrencyDegree::new(2));
        scheduler.run(&job, &ExtractOptions::default()).await;
        assert_eq!(engine.calls.load(Ordering::SeqCst), 9);
        assert!(engine.max_running.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn next_batch_starts_only_after_previous_batch_is_folded() -> Result<()> {
        let engine = Arc::new(ScriptedOcrEngine::default());
        let progress: Arc<dyn ProgressReporter> = {
            let events = engine.events.clone();
            Arc::new(move |_total: usize, done: usize| {
                events
                    .lock()
                    .expect("lock poisoned")
                    .push(format!("fold {done}"));
            })
        };
        let scheduler = BatchScheduler::new(engine.clone(), ConcurrencyDegree::new(2))
            .with_progress(progress);
        let job = job_with_pages(&[
            Some("p0"),
            Some("p1"),
            Some("p2"),
            Some("p3"),
            Some("p4"),
        ])?;
        scheduler.run(&job, &per_page()).await;

        let events = engine.events.lock().expect("lock poisoned").clone();
        let position = |event: &str| {
            events
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("missing {event:?} in {events:?}"))
        };
        assert!(position("start p2") > position("fold 1"), "{events:?}");
        assert!(position("start p2") > position("fold 2"), "{events:?}");
        assert!(position("start p4") > position("fold 3"), "{events:?}");
        assert!(position("start p4") > position("fold 4"), "{events:?}");
        assert!(position("fold 5") > position("start p4"), "{events:?}");
        Ok(())
    }

    #[tokio::test]
    async fn failed_pages_become_empty_text() -> Result<()> {
        let (calls, progress) = recording_progress();
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedOcrEngine::default()),
            ConcurrencyDegree::new(2),
        )
        .with_progress(progress);

        let job = job_with_pages(&[Some("FAIL"), Some("hello")])?;
        let result = scheduler.run(&job, &per_page()).await;
        assert_eq!(result.text.as_per_page(), Some(&strings(&["", "hello"])[..]));
        assert_eq!(result.word_count, 1);
        assert!(result.success);
        assert_eq!(*calls.lock().expect("lock poisoned"), vec![(2, 1), (2, 2)]);

        let job = job_with_pages(&[Some("FAIL"), Some("FAIL")])?;
        let result = scheduler.run(&job, &ExtractOptions::default()).await;
        assert_eq!(result.text.as_concatenated(), Some(""));
        assert!(!result.success);
        Ok(())
    }

    #[tokio::test]
    async fn slow_pages_time_out_as_empty_text() -> Result<()> {
        let (calls, progress) = recording_progress();
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedOcrEngine::default()),
            ConcurrencyDegree::new(2),
        )
        .with_progress(progress);
        let job = job_with_pages(&[Some("before"), Some("SLEEP"), Some("after")])?;
        let opts = ExtractOptions {
            page_timeout: Some(Duration::from_millis(100)),
            ..per_page()
        };
        let result = scheduler.run(&job, &opts).await;
        assert_eq!(
            result.text.as_per_page(),
            Some(&strings(&["before", "", "after"])[..])
        );
        // The timed-out page still counts as completed.
        assert_eq!(
            *calls.lock().expect("lock poisoned"),
            vec![(3, 1), (3, 2), (3, 3)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn dedup_applies_across_pages_in_both_modes() -> Result<()> {
        let job = job_with_pages(&[
            Some("EXIT, north"),
            Some("EXIT|south."),
            Some("north\n(EXIT)"),
        ])?;
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedOcrEngine::default()),
            ConcurrencyDegree::new(2),
        );

        let opts = ExtractOptions {
            remove_duplicates: true,
            ..ExtractOptions::default()
        };
        let concatenated = scheduler.run(&job, &opts).await;
        // `\n(` leaves an empty section, which is kept once.
        assert_eq!(
            concatenated.text.as_concatenated(),
            Some("EXIT\nnorth\nsouth\n")
        );
        assert_eq!(concatenated.word_count, 3);
        assert!(concatenated.success);

        let opts = ExtractOptions {
            aggregation_mode: AggregationMode::PerPage,
            ..opts
        };
        let per_page = scheduler.run(&job, &opts).await;
        assert_eq!(
            per_page.text.as_per_page(),
            Some(&strings(&["EXIT", "north", "south", ""])[..])
        );
        assert_eq!(per_page.word_count, 3);
        Ok(())
    }

    #[tokio::test]
    async fn trim_can_be_disabled() -> Result<()> {
        let job = job_with_pages(&[Some("  Title\n\n\x0C")])?;
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedOcrEngine::default()),
            ConcurrencyDegree::sequential(),
        );

        let trimmed = scheduler.run(&job, &ExtractOptions::default()).await;
        assert_eq!(trimmed.text.as_concatenated(), Some("Title"));

        let opts = ExtractOptions {
            trim: false,
            ..ExtractOptions::default()
        };
        let raw = scheduler.run(&job, &opts).await;
        assert_eq!(raw.text.as_concatenated(), Some("  Title\n\n\x0C"));
        Ok(())
    }
}

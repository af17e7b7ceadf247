//! Terminal UI: progress bars, plus a log writer that stays out of their way.
//!
//! The progress bar handling is adapted from `substudy` by Eric Kidd, which is
//! licensed under Apache-2.0 OR MIT. Used with permission.

use std::{
    borrow::Cow,
    io::{self, Write as _},
    sync::Arc,
    time::Duration,
};

use indicatif::{
    MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle,
};

/// How often our bars redraw themselves while waiting on slow OCR processes.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Receives progress updates from the OCR scheduler.
///
/// This is called synchronously, once for each page whose text has been
/// added to the result, so implementations should return quickly.
pub trait ProgressReporter: Send + Sync {
    /// Report that `completed_pages` out of `total_pages` are done.
    fn report(&self, total_pages: usize, completed_pages: usize);
}

impl<F> ProgressReporter for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn report(&self, total_pages: usize, completed_pages: usize) {
        self(total_pages, completed_pages)
    }
}

impl ProgressReporter for ProgressBar {
    fn report(&self, total_pages: usize, completed_pages: usize) {
        self.set_length(total_pages as u64);
        self.set_position(completed_pages as u64);
    }
}

/// Labels for a progress bar or spinner.
pub struct ProgressConfig<'a> {
    /// Emoji shown before the message.
    pub emoji: &'a str,
    /// Message shown while running.
    pub msg: &'a str,
    /// Message shown once finished.
    pub done_msg: &'a str,
}

/// Application UI state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI drawing to `stderr`.
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// Create a UI which never draws anything.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        let ui = Ui::init();
        ui.hide_progress_bars();
        ui
    }

    /// Stop drawing progress bars. We do this when our JSON output goes to
    /// `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A `tracing` writer which suspends our progress bars while writing.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Print a one-line message above any progress bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        let line = format!("{emoji} {msg}");
        if self.multi_progress.println(&line).is_err() {
            eprintln!("{line}");
        }
    }

    /// Add a bar counting pages.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        self.add(ProgressBar::new(len).with_style(page_bar_style()), config)
    }

    /// Add a spinner for work we can't measure.
    pub fn new_spinner(&self, config: &ProgressConfig<'_>) -> ProgressBar {
        self.add(ProgressBar::new_spinner().with_style(spinner_style()), config)
    }

    fn add(&self, bar: ProgressBar, config: &ProgressConfig<'_>) -> ProgressBar {
        let bar = self.multi_progress.add(bar);
        bar.set_prefix(config.emoji.to_owned());
        bar.set_message(config.msg.to_owned());
        bar.enable_steady_tick(TICK_INTERVAL);
        bar.with_finish(ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }
}

fn page_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:20} {pos:>4}/{len:4} pages {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg} {elapsed}")
        .expect("bad progress bar template")
}

/// Writes to `stderr` with our progress bars temporarily cleared, so log
/// lines don't get drawn over.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl SafeStderrWriter {
    fn suspended<R>(&self, f: impl FnOnce(&mut io::Stderr) -> R) -> R {
        self.ui.multi_progress.suspend(|| f(&mut io::stderr()))
    }
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.suspended(|stderr| stderr.write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // One suspend per log line, not one per partial write.
        self.suspended(|stderr| stderr.write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.suspended(|stderr| stderr.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

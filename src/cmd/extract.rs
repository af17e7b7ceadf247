//! The `extract` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use schemars::JsonSchema;

use crate::{
    async_utils::io::write_json_output,
    cpu_limit::ConcurrencyDegree,
    job::SourceKind,
    page_source::{PageSourceOptions, generate_pages},
    prelude::*,
    queues::ocr::{
        BatchScheduler, ExtractOptions,
        aggregate::{AggregationMode, ExtractionResult},
        engines::tesseract::{DEFAULT_LANGUAGE, TesseractOcrEngine},
    },
    ui::{ProgressConfig, Ui},
};

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The video or document to extract text from.
    pub input_path: PathBuf,

    /// Return a list with one entry per page, instead of a single string.
    #[clap(long)]
    pub by_page: bool,

    /// Reduce the text to unique lines and phrases. Useful for videos, where
    /// the same text appears in many frames.
    #[clap(long)]
    pub remove_duplicates: bool,

    /// Keep raw OCR output, without collapsing blank lines or trimming.
    #[clap(long)]
    pub no_trim: bool,

    /// Separate pages with a form feed when returning a single string.
    #[clap(long)]
    pub page_breaks: bool,

    /// Max number of pages to OCR at a time. Defaults to one third of the
    /// available CPUs.
    #[clap(short = 'j', long = "jobs")]
    pub job_count: Option<usize>,

    /// Give up on any single page after this many seconds.
    #[clap(long, value_name = "SECS")]
    pub page_timeout: Option<u64>,

    /// The `tesseract` language to recognize.
    #[clap(long, default_value = DEFAULT_LANGUAGE)]
    pub language: String,

    #[clap(flatten)]
    pub page_source_opts: PageSourceOptions,

    /// The output path to write the result to. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

impl ExtractOpts {
    /// Convert our command-line flags into scheduler options.
    fn to_extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            trim: !self.no_trim,
            aggregation_mode: if self.by_page {
                AggregationMode::PerPage
            } else {
                AggregationMode::Concatenated
            },
            remove_duplicates: self.remove_duplicates,
            page_breaks: self.page_breaks,
            page_timeout: self.page_timeout.map(Duration::from_secs),
        }
    }

    /// How many pages should we OCR at once?
    fn degree(&self) -> ConcurrencyDegree {
        match self.job_count {
            Some(job_count) => ConcurrencyDegree::new(job_count),
            None => ConcurrencyDegree::from_cpu_count(),
        }
    }
}

/// The output of the `extract` subcommand.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractOutput {
    /// The input path.
    pub path: PathBuf,

    /// The unique ID of this run.
    pub run_id: String,

    /// Was the input a video or a document?
    pub source_kind: SourceKind,

    /// How many page images we generated.
    pub page_count: usize,

    /// The extracted text.
    #[serde(flatten)]
    pub result: ExtractionResult,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(path = %opts.input_path.display()))]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    // Generate our page images.
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🖼️",
        msg: "Generating page images",
        done_msg: "Generated page images",
    });
    let job = generate_pages(&opts.input_path, &opts.page_source_opts).await?;
    spinner.finish_using_style();
    debug!(
        run_id = %job.run_id(),
        kind = ?job.kind(),
        page_count = job.page_count(),
        "Generated pages"
    );

    // OCR our pages.
    let degree = opts.degree();
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔍",
            msg: "OCRing pages",
            done_msg: "OCRed pages",
        },
        job.page_count() as u64,
    );
    let engine = Arc::new(TesseractOcrEngine::new(opts.language.clone()));
    let scheduler = BatchScheduler::new(engine, degree).with_progress(Arc::new(pb.clone()));
    let result = scheduler.run(&job, &opts.to_extract_options()).await;
    pb.finish_using_style();
    ui.display_message(
        "📝",
        &format!(
            "Found {} words on {} pages",
            result.word_count,
            job.page_count()
        ),
    );

    let success = result.success;
    let output = ExtractOutput {
        path: job.source_path().to_owned(),
        run_id: job.run_id().to_string(),
        source_kind: job.kind(),
        page_count: job.page_count(),
        result,
    };
    write_json_output(opts.output_path.as_deref(), &output).await?;

    if !success {
        return Err(anyhow!("no text found in {}", opts.input_path.display()));
    }
    Ok(())
}

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::LevelFilter, fmt::format::FmtSpan,
    layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod cpu_limit;
mod dedup;
mod job;
mod page_source;
mod prelude;
mod queues;
mod text;
mod ui;

/// Extract text from videos and documents using OCR.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
External Tools:
  - tesseract: OCRs each page.
  - ffmpeg: Samples frames from videos.
  - convert (ImageMagick): Rasterizes PDFs and images.

Environment Variables:
  - RUST_LOG (optional): Log filter, for example `pagetext=debug`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Extract text from a video or document, writing JSON.
    Extract(cmd::extract::ExtractOpts),
    /// Print JSON schemas for our output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Where is this subcommand writing its output, if not to `stdout`?
    fn output_path(&self) -> Option<&Path> {
        match self {
            Cmd::Extract(opts) => opts.output_path.as_deref(),
            Cmd::Schema(opts) => opts.output_path.as_deref(),
        }
    }
}

/// Send `tracing` output to `stderr`, without trampling on progress bars.
///
/// We log at `info` unless `RUST_LOG` says otherwise.
fn init_tracing(ui: &Ui) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` is optional, and may set `RUST_LOG`, so load it first.
    dotenvy::dotenv().ok();

    let ui = Ui::init();
    init_tracing(&ui);

    let opts = Opts::parse();
    run(ui, &opts.subcmd).await
}

#[instrument(level = "debug", name = "main", skip_all)]
async fn run(ui: Ui, subcmd: &Cmd) -> Result<()> {
    debug!("Parsed subcommand: {:?}", subcmd);

    // Keep the terminal quiet when our JSON goes to stdout.
    if subcmd.output_path().is_none() {
        ui.hide_progress_bars();
    }

    match subcmd {
        Cmd::Extract(opts) => cmd::extract::cmd_extract(ui, opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}

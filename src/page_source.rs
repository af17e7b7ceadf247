//! Turn a video or document into one image per page.
//!
//! Videos are sampled into JPEG frames with `ffmpeg`, and documents (PDFs and
//! most image formats) are rasterized with ImageMagick's `convert`. Either way,
//! the images land in a temporary directory owned by the resulting
//! [`ExtractionJob`].

use std::sync::LazyLock;

use clap::Args;
use regex::Regex;
use tokio::process::Command;
use uuid::Uuid;

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    job::{ExtractionJob, SourceKind},
    prelude::*,
};

/// File extensions we treat as videos.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mpeg", "m4v", "mov"];

/// File extensions we treat as documents.
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "jpg", "jpeg", "png", "gif", "ai", "psd"];

/// ImageMagick errors look like `convert: ... error/...`.
static CONVERT_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^convert(-im6\.q16)?: .*\berror\b").expect("failed to compile regex")
});

/// Does this line of `convert` output contain an error?
fn is_convert_error_line(line: &str) -> bool {
    CONVERT_ERROR_REGEX.is_match(line)
}

/// Options for generating page images.
#[derive(Args, Clone, Debug)]
pub struct PageSourceOptions {
    /// How many frames per second to sample from videos.
    #[clap(long, default_value = "5")]
    pub frame_rate: u32,

    /// The density (DPI) used to rasterize documents.
    #[clap(long, default_value = "600")]
    pub density: u32,

    /// How many digits to use when numbering video frames.
    #[clap(long, default_value = "4")]
    pub placeholders: usize,

    /// Where to create temporary page images. Defaults to the system
    /// temporary directory.
    #[clap(long)]
    pub tmp_dir: Option<PathBuf>,
}

impl Default for PageSourceOptions {
    fn default() -> Self {
        Self {
            frame_rate: 5,
            density: 600,
            placeholders: 4,
            tmp_dir: None,
        }
    }
}

impl SourceKind {
    /// Decide whether `path` is a video or a document.
    ///
    /// We trust well-known extensions first. For anything else, we sniff the
    /// file contents, then fall back to guessing a MIME type from the name.
    pub fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(Self::Video);
        }
        if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(Self::Document);
        }

        let sniffed = infer::get_from_path(path)
            .with_context(|| format!("failed to read {:?}", path.display()))?
            .map(|kind| kind.mime_type().to_owned());
        let mime_type = sniffed
            .or_else(|| mime_guess::from_path(path).first().map(|m| m.to_string()))
            .ok_or_else(|| anyhow!("unknown file type for {:?}", path.display()))?;
        if mime_type.starts_with("video/") {
            Ok(Self::Video)
        } else if mime_type.starts_with("image/") || mime_type == "application/pdf" {
            Ok(Self::Document)
        } else {
            Err(anyhow!(
                "unsupported file type {} for {:?} (supported: videos, PDFs and images)",
                mime_type,
                path.display()
            ))
        }
    }
}

/// The file name prefix shared by every page image of a run.
fn page_file_prefix(run_id: Uuid) -> String {
    format!("page-{run_id}-")
}

/// The file name of a single page image.
fn page_file_name(
    kind: SourceKind,
    run_id: Uuid,
    page_idx: usize,
    placeholders: usize,
) -> String {
    let prefix = page_file_prefix(run_id);
    match kind {
        SourceKind::Video => format!("{prefix}{page_idx:0placeholders$}.jpg"),
        SourceKind::Document => format!("{prefix}{page_idx}.jpg"),
    }
}

/// Generate page images for `path`, and return a job describing them.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn generate_pages(
    path: &Path,
    options: &PageSourceOptions,
) -> Result<ExtractionJob> {
    if !path.is_file() {
        return Err(anyhow!("input file {:?} does not exist", path.display()));
    }
    let kind = SourceKind::detect(path)?;
    let run_id = Uuid::new_v4();

    // Create a temporary directory to hold the page images.
    let tmpdir = match &options.tmp_dir {
        Some(parent) => tempfile::TempDir::with_prefix_in("pages", parent),
        None => tempfile::TempDir::with_prefix("pages"),
    }
    .context("failed to create temporary directory for page images")?;

    match kind {
        SourceKind::Video => {
            sample_video_frames(path, tmpdir.path(), run_id, options).await?
        }
        SourceKind::Document => {
            rasterize_document(path, tmpdir.path(), run_id, options).await?
        }
    }

    let page_count = count_page_images(tmpdir.path(), run_id)?;
    if page_count == 0 {
        return Err(anyhow!("no page images were generated from {:?}", path.display()));
    }
    debug!(%run_id, ?kind, page_count, "Generated page images");

    let page_paths = (0..page_count)
        .map(|page_idx| {
            tmpdir.path().join(page_file_name(
                kind,
                run_id,
                page_idx,
                options.placeholders,
            ))
        })
        .collect();
    Ok(ExtractionJob::new(path.to_owned(), run_id, kind, page_paths).with_tmpdir(tmpdir))
}

/// Count the page images generated for `run_id` in `dir`.
fn count_page_images(dir: &Path, run_id: Uuid) -> Result<usize> {
    let prefix = page_file_prefix(run_id);
    let mut count = 0;
    for entry in dir
        .read_dir()
        .with_context(|| format!("failed to read directory {:?}", dir.display()))?
    {
        let entry = entry.with_context(|| {
            format!("failed to read entry in directory {:?}", dir.display())
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".jpg") {
            count += 1;
        }
    }
    Ok(count)
}

/// Does our `ffmpeg` support CUDA hardware decoding?
async fn ffmpeg_supports_cuda() -> bool {
    match Command::new("ffmpeg").arg("-hwaccels").output().await {
        Ok(output) => {
            // `ffmpeg` prints its banner to stderr, and the list to stdout.
            let stdout = String::from_utf8_lossy(&output.stdout);
            stdout.lines().any(|line| line.trim() == "cuda")
        }
        Err(err) => {
            debug!("could not probe ffmpeg hardware acceleration: {}", err);
            false
        }
    }
}

/// Sample frames from a video into `out_dir`.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), %run_id))]
async fn sample_video_frames(
    path: &Path,
    out_dir: &Path,
    run_id: Uuid,
    options: &PageSourceOptions,
) -> Result<()> {
    let out_path = out_dir.join(format!(
        "{}%0{}d.jpg",
        page_file_prefix(run_id),
        options.placeholders
    ));

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-nostdin").arg("-hide_banner");
    if ffmpeg_supports_cuda().await {
        cmd.arg("-hwaccel").arg("cuda");
    }
    cmd.arg("-i")
        .arg(path)
        .arg("-vf")
        .arg(format!("setsar=1, fps={}", options.frame_rate))
        .arg("-q:v")
        .arg("9")
        .arg("-threads")
        .arg("4")
        .arg("-start_number")
        .arg("0")
        .arg(out_path)
        .kill_on_drop(true);

    // `ffmpeg` will happily use several cores, so we make sure we're not
    // running a pile of them at once.
    let output = with_cpu_semaphore(move || async move {
        cmd.output()
            .await
            .with_context(|| format!("failed to run ffmpeg on {:?}", path.display()))
    })
    .await?;
    check_for_command_failure("ffmpeg", &output, None)
}

/// Rasterize each page of a document into `out_dir`.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), %run_id))]
async fn rasterize_document(
    path: &Path,
    out_dir: &Path,
    run_id: Uuid,
    options: &PageSourceOptions,
) -> Result<()> {
    let out_path = out_dir.join(format!("{}%d.jpg", page_file_prefix(run_id)));

    let mut cmd = Command::new("convert");
    cmd.arg("-quiet")
        .arg("-density")
        .arg(options.density.to_string())
        // Some documents fail to rasterize without an explicit size.
        .arg("-resize")
        .arg("7680x4320")
        // Flatten transparent layers onto a white background.
        .arg("-background")
        .arg("White")
        .arg("-alpha")
        .arg("background")
        .arg("-alpha")
        .arg("off")
        .arg("+adjoin")
        // Remove padding around the page.
        .arg("-trim")
        .arg(path)
        .arg("-quality")
        .arg("90")
        .arg(out_path)
        .kill_on_drop(true);

    let output = with_cpu_semaphore(move || async move {
        cmd.output()
            .await
            .with_context(|| format!("failed to run convert on {:?}", path.display()))
    })
    .await?;
    check_for_command_failure("convert", &output, Some(&is_convert_error_line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_uses_known_extensions() -> Result<()> {
        assert_eq!(SourceKind::detect(Path::new("talk.MP4"))?, SourceKind::Video);
        assert_eq!(SourceKind::detect(Path::new("clip.mov"))?, SourceKind::Video);
        assert_eq!(SourceKind::detect(Path::new("scan.pdf"))?, SourceKind::Document);
        assert_eq!(SourceKind::detect(Path::new("logo.psd"))?, SourceKind::Document);
        Ok(())
    }

    #[test]
    fn detect_sniffs_files_without_extensions() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("detect-test")?;
        let path = tmpdir.path().join("upload");
        std::fs::write(&path, b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n")?;
        assert_eq!(SourceKind::detect(&path)?, SourceKind::Document);
        Ok(())
    }

    #[test]
    fn detect_rejects_unsupported_files() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("detect-test")?;
        let path = tmpdir.path().join("notes.txt");
        std::fs::write(&path, "just some notes")?;
        assert!(SourceKind::detect(&path).is_err());
        Ok(())
    }

    #[test]
    fn page_file_names_follow_tool_numbering() {
        let run_id = Uuid::nil();
        assert_eq!(
            page_file_name(SourceKind::Video, run_id, 7, 4),
            format!("page-{run_id}-0007.jpg")
        );
        assert_eq!(
            page_file_name(SourceKind::Document, run_id, 12, 4),
            format!("page-{run_id}-12.jpg")
        );
    }

    #[test]
    fn count_page_images_only_counts_this_run() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("count-test")?;
        let run_id = Uuid::new_v4();
        for page_idx in 0..3 {
            let name = page_file_name(SourceKind::Document, run_id, page_idx, 4);
            std::fs::write(tmpdir.path().join(name), b"jpeg")?;
        }
        let other = page_file_name(SourceKind::Document, Uuid::new_v4(), 0, 4);
        std::fs::write(tmpdir.path().join(other), b"jpeg")?;
        std::fs::write(tmpdir.path().join(format!("page-{run_id}-x.png")), b"png")?;
        assert_eq!(count_page_images(tmpdir.path(), run_id)?, 3);
        Ok(())
    }

    #[test]
    fn is_convert_error_line_works() {
        assert!(is_convert_error_line(
            "convert: no images defined `out.jpg' @ error/convert.c/ConvertImageCommand/3229."
        ));
        assert!(is_convert_error_line(
            "convert-im6.q16: unable to open image `x.pdf': error/blob.c/OpenBlob/2874."
        ));
        assert!(!is_convert_error_line("Warning: something is odd"));
    }

    #[tokio::test]
    async fn generate_pages_fails_for_missing_input() {
        let result =
            generate_pages(Path::new("does/not/exist.pdf"), &PageSourceOptions::default())
                .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires ffmpeg to be installed"]
    async fn generate_pages_samples_video_frames() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("video-test")?;
        let video_path = tmpdir.path().join("test.mp4");
        let output = Command::new("ffmpeg")
            .args(["-nostdin", "-f", "lavfi", "-i", "testsrc=duration=1:rate=10"])
            .arg(&video_path)
            .output()
            .await?;
        check_for_command_failure("ffmpeg", &output, None)?;

        let job = generate_pages(&video_path, &PageSourceOptions::default()).await?;
        assert_eq!(job.kind(), SourceKind::Video);
        assert!(job.page_count() >= 4);
        assert!(job.page_paths().iter().all(|p| p.exists()));
        Ok(())
    }
}

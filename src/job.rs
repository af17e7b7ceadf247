//! A single extraction run over one video or document.

use schemars::JsonSchema;
use uuid::Uuid;

use crate::prelude::*;

/// What kind of file are we extracting pages from?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A video, sampled into frames.
    Video,
    /// A PDF or image, rasterized into pages.
    Document,
}

/// One run of the extraction pipeline.
///
/// Page image paths are index-aligned with page numbers, starting at 0. A
/// path may not exist on disk, in which case the page is skipped.
pub struct ExtractionJob {
    /// The file we're extracting text from.
    source_path: PathBuf,
    /// Unique ID for this run. Used to name any files we generate.
    run_id: Uuid,
    /// What kind of file is `source_path`?
    kind: SourceKind,
    /// One image per page, in page order.
    page_paths: Vec<PathBuf>,
    /// An optional temporary directory holding our page images.
    ///
    /// This is released by [`Drop`].
    tmpdir: Option<tempfile::TempDir>,
}

impl ExtractionJob {
    /// Create a new job from an already-generated list of page images.
    pub fn new(
        source_path: PathBuf,
        run_id: Uuid,
        kind: SourceKind,
        page_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            source_path,
            run_id,
            kind,
            page_paths,
            tmpdir: None,
        }
    }

    /// Take ownership of the temporary directory holding our page images. It
    /// will be deleted when the job is dropped.
    pub fn with_tmpdir(mut self, tmpdir: tempfile::TempDir) -> Self {
        self.tmpdir = Some(tmpdir);
        self
    }

    /// The file we're extracting text from.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// The unique ID of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// What kind of file are we processing?
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Page images, in page order.
    pub fn page_paths(&self) -> &[PathBuf] {
        &self.page_paths
    }

    /// How many pages does this job have?
    pub fn page_count(&self) -> usize {
        self.page_paths.len()
    }
}

impl Drop for ExtractionJob {
    fn drop(&mut self) {
        // Delete our temporary directory, if we have one.
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    run_id = %self.run_id,
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

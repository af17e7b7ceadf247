//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::{fmt, num::NonZeroUsize, sync::LazyLock};

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `ffmpeg` and `convert`
/// processes.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// How many CPUs we leave for each OCR process.
///
/// `tesseract` runs its own threads and can use a lot of memory on large
/// pages, so we divide the available cores instead of oversubscribing them.
const CPUS_PER_OCR_PROCESS: usize = 3;

/// The maximum number of OCR invocations allowed in flight at once. Always at
/// least 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConcurrencyDegree(NonZeroUsize);

impl ConcurrencyDegree {
    /// Create a degree from a requested value, clamping 0 to 1.
    pub fn new(degree: usize) -> Self {
        NonZeroUsize::new(degree)
            .map(Self)
            .unwrap_or_else(Self::sequential)
    }

    /// Run one OCR invocation at a time.
    pub fn sequential() -> Self {
        Self(NonZeroUsize::MIN)
    }

    /// Compute the degree for a host with `cpu_count` CPUs.
    pub fn for_cpu_count(cpu_count: usize) -> Self {
        Self::new(cpu_count.div_ceil(CPUS_PER_OCR_PROCESS))
    }

    /// Compute the degree for the current host.
    pub fn from_cpu_count() -> Self {
        let cpu_count = num_cpus::get();
        let degree = Self::for_cpu_count(cpu_count);
        debug!(cpu_count, degree = degree.get(), "Computed OCR concurrency");
        degree
    }

    /// Get the degree as a plain number.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for ConcurrencyDegree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core. Page generation tools like `ffmpeg` and
/// `convert` should always run inside this.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    result
}

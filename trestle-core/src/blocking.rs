// Blocking work offload

use crate::Error;
use crate::logging::trace;
use tokio::runtime::Handle;

/// A unit of blocking work.
pub type BlockingJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking jobs away from request-processing threads.
///
/// Resolved from the registry as `dyn BlockingExecutor`; handlers use it
/// through [`Context::blocking`](crate::Context::blocking).
pub trait BlockingExecutor: Send + Sync {
    fn submit(&self, job: BlockingJob) -> Result<(), Error>;
}

/// Submits jobs to the blocking pool of the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioBlockingExecutor;

impl BlockingExecutor for TokioBlockingExecutor {
    fn submit(&self, job: BlockingJob) -> Result<(), Error> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Blocking(format!("no runtime available: {e}")))?;
        trace!("Submitting blocking job");
        // Completion is reported through the job itself.
        drop(handle.spawn_blocking(job));
        Ok(())
    }
}

/// Runs jobs inline on the calling thread. Useful in tests that assert
/// ordering without a thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl BlockingExecutor for InlineExecutor {
    fn submit(&self, job: BlockingJob) -> Result<(), Error> {
        job();
        Ok(())
    }
}

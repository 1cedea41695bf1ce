use crate::Error;
use rayon::prelude::*;

/// Worker pool for batch fan-out and awaited sub-tasks. Without a dedicated pool,
/// batches run on rayon's global pool.
#[derive(Debug, Default)]
pub struct TaskPool {
    pool: Option<rayon::ThreadPool>,
}

impl TaskPool {
    pub fn global() -> Self {
        Self { pool: None }
    }

    pub fn with_threads(num_threads: usize) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("skelanim-worker-{i}"))
            .build()
            .map_err(|e| Error::TaskPool {
                message: e.to_string(),
            })?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Wraps `job` in a call that only runs when awaited with [`BlockingCall::wait`].
    pub fn blocking<F, R>(&self, job: F) -> BlockingCall<'_, F>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        BlockingCall { pool: self, job }
    }

    /// Runs `f` on every item in parallel, one task per item, and returns the results in
    /// item order once all of them finish.
    pub fn map_batches<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        let run = move || -> Vec<R> { items.into_par_iter().map(f).collect() };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

/// A sub-task the caller waits on synchronously.
#[must_use = "a blocking call does nothing until waited on"]
pub struct BlockingCall<'p, F> {
    pool: &'p TaskPool,
    job: F,
}

impl<F, R> BlockingCall<'_, F>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    /// Runs the job on the pool and blocks until it returns. Called from inside the pool,
    /// the job runs on the current worker.
    pub fn wait(self) -> R {
        match &self.pool.pool {
            Some(pool) => pool.install(self.job),
            None => (self.job)(),
        }
    }
}

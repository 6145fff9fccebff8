#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::cache::Cache;
use crate::context::Environment;
use crate::error::Error;
use crate::metadata::{Metadata, Status};
use crate::parse::parse_query;
use crate::state::State;

/// Creates the cache of a worker
pub type CacheFactory = Arc<dyn Fn() -> Result<Arc<dyn Cache>, Error> + Send + Sync>;

/// How workers reach the cache
#[derive(Clone)]
pub enum PoolMode {
    /// All workers share the cache of the environment
    Central,
    /// Every worker builds its own cache; only useful with a backend shared outside the process
    /// (file or SQL cache)
    Local(CacheFactory),
}

struct Job {
    query: String,
    cancelled: Arc<AtomicBool>,
    sender: oneshot::Sender<Result<State, Error>>,
}

/// Handle of a query submitted for background evaluation
pub struct EvaluationHandle {
    query: String,
    receiver: oneshot::Receiver<Result<State, Error>>,
    cancelled: Arc<AtomicBool>,
}

impl EvaluationHandle {
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Request cancellation; the evaluation stops at the next action or progress report
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Block until the result is available. Must not be called from an async context.
    pub fn wait(self) -> Result<State, Error> {
        self.receiver.blocking_recv().map_err(|_| {
            Error::execution_error(format!("Evaluation of '{}' was dropped", self.query))
        })?
    }

    /// Wait for the result asynchronously
    pub async fn join(self) -> Result<State, Error> {
        let query = self.query;
        self.receiver.await.map_err(|_| {
            Error::execution_error(format!("Evaluation of '{}' was dropped", query))
        })?
    }

    /// Result if the evaluation already finished
    pub fn try_result(&mut self) -> Option<Result<State, Error>> {
        self.receiver.try_recv().ok()
    }
}

/// Worker pool evaluating queries in the background.
/// The pool owns its runtime; evaluations run on blocking threads.
/// Dropping the pool does not wait for running evaluations, so it can be dropped from async code.
pub struct Pool {
    // dropped before the runtime, which closes the queue and lets the workers finish
    sender: Option<mpsc::UnboundedSender<Job>>,
    runtime: Option<tokio::runtime::Runtime>,
    envref: Arc<Environment>,
    status_cache: Option<Arc<dyn Cache>>,
    workers: usize,
}

impl Pool {
    /// Start a pool with the given number of workers (at least one)
    pub fn new(envref: Arc<Environment>, workers: usize, mode: PoolMode) -> Result<Pool, Error> {
        let workers = workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("liquer-pool")
            .enable_all()
            .build()
            .map_err(|e| Error::general_error(format!("Can't start the pool runtime: {}", e)))?;
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut status_cache = None;
        for id in 0..workers {
            let worker_env = match &mode {
                PoolMode::Central => envref.clone(),
                PoolMode::Local(factory) => {
                    let cache = factory()?;
                    if status_cache.is_none() {
                        status_cache = Some(cache.clone());
                    }
                    envref.fork_with_cache(cache)
                }
            };
            let receiver = receiver.clone();
            runtime.spawn_blocking(move || worker(id, worker_env, receiver));
        }
        tracing::info!(workers, "pool started");
        Ok(Pool {
            sender: Some(sender),
            runtime: Some(runtime),
            envref,
            status_cache,
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn cache(&self) -> Arc<dyn Cache> {
        match &self.status_cache {
            Some(cache) => cache.clone(),
            None => self.envref.get_cache(),
        }
    }

    /// Submit a query. The `submitted` status is written to the cache before returning,
    /// unless the cache already holds the result.
    ///
    /// With [PoolMode::Local] the status goes to the cache of the first worker while any worker
    /// may evaluate the query. The status reaches `ready` only when the worker caches share
    /// a backend (file or SQL cache); with per-worker memory caches it stays `submitted`.
    pub fn evaluate_in_background(&self, query: &str) -> EvaluationHandle {
        let query = parse_query(query)
            .map(|q| q.encode())
            .unwrap_or_else(|_| query.to_owned());
        let cache = self.cache();
        if cache.get(&query).is_none() {
            let mut metadata = Metadata::new();
            metadata.with_query(&query);
            metadata.set_status(Status::Submitted);
            if let Err(e) = cache.store_metadata(&metadata) {
                tracing::warn!(%query, error = %e, "submitted status not stored");
            }
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = oneshot::channel();
        let job = Job {
            query: query.clone(),
            cancelled: cancelled.clone(),
            sender,
        };
        match &self.sender {
            Some(queue) => {
                if let Err(mpsc::error::SendError(job)) = queue.send(job) {
                    let _ = job
                        .sender
                        .send(Err(Error::execution_error("Pool is closed".to_owned())));
                }
            }
            None => {
                let _ = job
                    .sender
                    .send(Err(Error::execution_error("Pool is closed".to_owned())));
            }
        }
        EvaluationHandle {
            query,
            receiver,
            cancelled,
        }
    }

    /// Evaluate in the pool and wait for the result
    pub fn evaluate(&self, query: &str) -> Result<State, Error> {
        self.evaluate_in_background(query).wait()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn worker(id: usize, envref: Arc<Environment>, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        let job = {
            let mut receiver = receiver.blocking_lock();
            receiver.blocking_recv()
        };
        let job = match job {
            Some(job) => job,
            None => break,
        };
        tracing::debug!(worker = id, query = %job.query, "evaluation started");
        let cache = envref.get_cache();
        if let Some(mut metadata) = cache.get_metadata(&job.query) {
            if metadata.status == Status::Submitted {
                metadata.set_status(Status::Evaluation);
                if let Err(e) = cache.store_metadata(&metadata) {
                    tracing::warn!(query = %job.query, error = %e, "evaluation status not stored");
                }
            }
        }
        let result = envref
            .new_context()
            .with_cancel_flag(job.cancelled.clone())
            .evaluate(&job.query);
        if let Ok(state) = &result {
            tracing::debug!(worker = id, query = %job.query, status = %state.status(), "evaluation finished");
        }
        if job.sender.send(result).is_err() {
            tracing::debug!(worker = id, query = %job.query, "result not collected");
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::command_metadata::{ArgumentInfo, CommandMetadata};
    use crate::value::Value;
    use std::time::Duration;

    fn environment() -> Result<Arc<Environment>, Error> {
        let env = Environment::new();
        env.with_cache(Arc::new(MemoryCache::new()));
        let mut slow = CommandMetadata::first("slow");
        slow.with_argument(ArgumentInfo::integer_argument("x"));
        env.register_command(slow, |_, args, context| {
            let x: i64 = args.get(0, "x")?;
            for i in 0..5 {
                context.progress(i, Some(5), "waiting")?;
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(Value::I64(x))
        })?;
        Ok(env)
    }

    #[test]
    fn background_evaluation() -> Result<(), Error> {
        let env = environment()?;
        let pool = Pool::new(env.clone(), 2, PoolMode::Central)?;
        let handles: Vec<EvaluationHandle> = (0..4)
            .map(|i| pool.evaluate_in_background(&format!("slow-{}", i)))
            .collect();
        let status = env.get_cache().get_metadata("slow-3").map(|m| m.status);
        assert!(status.map_or(false, |s| s.is_processing() || s == Status::Ready));
        for (i, handle) in handles.into_iter().enumerate() {
            let state = handle.wait()?;
            assert_eq!(*state.get()?, Value::I64(i as i64));
        }
        assert_eq!(
            env.get_cache().get_metadata("slow-0").map(|m| m.status),
            Some(Status::Ready)
        );
        Ok(())
    }

    #[test]
    fn cancelled_job() -> Result<(), Error> {
        let env = environment()?;
        let pool = Pool::new(env, 1, PoolMode::Central)?;
        let blocker = pool.evaluate_in_background("slow-1");
        let handle = pool.evaluate_in_background("slow-2");
        handle.cancel();
        let state = handle.wait()?;
        assert!(state.is_error());
        assert!(blocker.wait()?.get().is_ok());
        Ok(())
    }

    #[test]
    fn local_caches() -> Result<(), Error> {
        let env = environment()?;
        let factory: CacheFactory = Arc::new(|| Ok(Arc::new(MemoryCache::new()) as Arc<dyn Cache>));
        let pool = Pool::new(env, 2, PoolMode::Local(factory))?;
        assert_eq!(pool.evaluate("slow-7")?.get()?.clone(), Value::I64(7));
        Ok(())
    }

    #[test]
    fn local_workers_sharing_a_backend_report_ready() -> Result<(), Error> {
        let env = environment()?;
        let shared: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let backend = shared.clone();
        let factory: CacheFactory = Arc::new(move || Ok(backend.clone()));
        let pool = Pool::new(env, 3, PoolMode::Local(factory))?;
        let handles: Vec<EvaluationHandle> = (0..3)
            .map(|i| pool.evaluate_in_background(&format!("slow-{}", i)))
            .collect();
        for handle in handles {
            handle.wait()?;
        }
        for i in 0..3 {
            assert_eq!(
                shared.get_metadata(&format!("slow-{}", i)).map(|m| m.status),
                Some(Status::Ready)
            );
        }
        Ok(())
    }
}

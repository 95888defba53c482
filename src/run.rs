use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::color::Palette;
use crate::config::TailfinConfig;
use crate::engine::{ContainerEngine, EngineError};
use crate::options::{ResumeToken, TailOptions};
use crate::output::Sink;
use crate::ratelimit::RateLimiter;
use crate::render::Renderer;
use crate::tail::{Tail, TailError};
use crate::target::{Target, TargetFilter};
use crate::watch;

/// Retry budget per supervising task: two immediate attempts, then one
/// every twenty seconds.
const RETRY_PERIOD: Duration = Duration::from_secs(20);
const RETRY_BURST: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(
        "reached the maximum number of log requests ({0}), \
         use --max-log-requests to increase the limit"
    )]
    TooManyLogRequests(usize),
    #[error("failed to tail {name}: {error}")]
    Tail { name: String, error: TailError },
}

/// Everything a supervising task needs, cloned into each of them.
#[derive(Clone)]
struct Shared {
    engine: Arc<dyn ContainerEngine>,
    filter: Arc<TargetFilter>,
    options: Arc<TailOptions>,
    renderer: Arc<Renderer>,
    palette: Palette,
    labels: Vec<String>,
    out: Sink,
    err_out: Sink,
    cancel: CancellationToken,
}

impl Shared {
    fn new_tail(&self, target: Target) -> Tail {
        Tail::new(
            self.engine.clone(),
            target,
            &self.palette,
            self.options.clone(),
            self.renderer.clone(),
            self.out.clone(),
            self.err_out.clone(),
        )
    }
}

/// Entry point of the core: discovers targets and supervises one tail per
/// target until the snapshot is exhausted (non-follow) or the run is
/// cancelled (follow).
pub async fn run(
    engine: Arc<dyn ContainerEngine>,
    config: TailfinConfig,
    out: Sink,
    err_out: Sink,
    cancel: CancellationToken,
) -> Result<(), RunError> {
    let follow = config.options.follow;
    let max_log_requests = config.max_log_requests;
    let cache_size = std::cmp::max(2 * max_log_requests, 100);

    let shared = Shared {
        engine,
        filter: Arc::new(TargetFilter::new(config.filter, cache_size)),
        options: Arc::new(config.options),
        renderer: Arc::new(config.renderer),
        palette: config.palette,
        labels: config.labels,
        out,
        err_out,
        cancel,
    };

    if follow {
        run_follow(shared, max_log_requests).await
    } else {
        run_once(shared, max_log_requests).await
    }
}

/// One-shot mode: tail the current snapshot of containers to EOF, bounded
/// by a worker pool. The first failure on a still-active container is
/// returned once every worker finished.
async fn run_once(shared: Shared, max_log_requests: usize) -> Result<(), RunError> {
    let ids = shared.engine.list_containers(&shared.labels).await?;
    let semaphore = Arc::new(Semaphore::new(max_log_requests));
    let mut tasks: JoinSet<Result<(), RunError>> = JoinSet::new();

    for id in ids {
        let record = match shared.engine.inspect_container(&id).await {
            Ok(record) => record,
            Err(e) => {
                shared
                    .err_out
                    .write_line(&format!("failed to inspect container id={id}: {e}"));
                continue;
            }
        };
        let mut found = Vec::new();
        shared.filter.visit(&record, |t| found.push(t));

        for target in found {
            let shared = shared.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore closed while workers are running");
                let name = target.name.clone();
                let id = target.id.clone();
                let mut tail = shared.new_tail(target);
                let result = tail.start(&shared.cancel).await;
                tail.close();
                match result {
                    Ok(()) => Ok(()),
                    Err(error) if shared.filter.is_active(&id) => {
                        shared
                            .err_out
                            .write_line(&format!("failed to tail {name}: {error}"));
                        Err(RunError::Tail { name, error })
                    }
                    Err(_) => Ok(()),
                }
            });
        }
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => error!("tail worker failed: {e}"),
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Follow mode: every discovered target gets a supervising task that keeps
/// its tail alive through transient failures. A hard ceiling on concurrent
/// requests turns runaway discovery into a fatal error instead of an
/// unbounded fan-out.
async fn run_follow(shared: Shared, max_log_requests: usize) -> Result<(), RunError> {
    let mut added = watch::watch_targets(
        shared.engine.clone(),
        shared.filter.clone(),
        shared.labels.clone(),
        shared.err_out.clone(),
        shared.cancel.clone(),
    )
    .await?;

    let num_requests = Arc::new(AtomicI64::new(0));
    let mut tasks = JoinSet::new();
    let mut saturated = None;

    while let Some(target) = added.recv().await {
        let active = num_requests.fetch_add(1, Ordering::SeqCst) + 1;
        if active > max_log_requests as i64 {
            saturated = Some(RunError::TooManyLogRequests(max_log_requests));
            break;
        }
        let shared = shared.clone();
        let counter = num_requests.clone();
        tasks.spawn(async move {
            tail_target(shared, target).await;
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    }

    // Either the run was cancelled, the subscription broke, or the ceiling
    // was hit: stop the remaining tails and let them print their banners.
    shared.cancel.cancel();
    while tasks.join_next().await.is_some() {}
    match saturated {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Keeps one target tailed: retries through the rate limiter with the
/// resume position of the previous attempt, stops for good when the
/// container is no longer active.
async fn tail_target(shared: Shared, target: Target) {
    let mut limiter = RateLimiter::new(RETRY_PERIOD, RETRY_BURST);
    let mut resume: Option<ResumeToken> = None;
    loop {
        if !limiter.acquire(&shared.cancel).await {
            return;
        }
        let mut tail = shared.new_tail(target.clone());
        let result = match resume.clone() {
            None => tail.start(&shared.cancel).await,
            Some(token) => tail.resume(&shared.cancel, token).await,
        };
        tail.close();

        match result {
            Ok(()) => {
                // The stream ended cleanly, most likely because the
                // container stopped. Keep the position for a restart.
                if let Some(token) = tail.resume_request() {
                    shared.filter.set_resume_request(&target.id, token);
                }
                return;
            }
            Err(error) => {
                if !shared.filter.is_active(&target.id) {
                    shared.err_out.write_line(&format!("failed to tail: {error}"));
                    if let Some(token) = tail.resume_request() {
                        shared.filter.set_resume_request(&target.id, token);
                    }
                    return;
                }
                shared
                    .err_out
                    .write_line(&format!("failed to tail: {error}, will retry"));
                if let Some(token) = tail.resume_request() {
                    resume = Some(token);
                }
            }
        }
    }
}

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Error, Result};

/// Outcome of a batch fetch.
#[derive(Debug)]
pub struct BatchResult<R> {
    /// One entry per input id, in input order. `None` marks a failed item.
    pub items: Vec<(String, Option<R>)>,
    pub failures: usize,
    /// First authentication/permission failure, if any. Outstanding
    /// items are cancelled once one is seen.
    pub fatal: Option<Error>,
}

impl<R> BatchResult<R> {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|(_, r)| r.is_some()).count()
    }
}

/// Run `fetch` for every id on at most `workers` concurrent tasks.
///
/// Each spawned task returns `(index, result)`, and results are slotted
/// into a vector sized up front, so output order never depends on
/// completion order. A failed item is logged and yields `None` without
/// disturbing the others. `on_done(done, total)` is called as items finish.
pub async fn fetch_batch<R, F, Fut>(
    ids: &[String],
    workers: usize,
    fetch: F,
    mut on_done: impl FnMut(usize, usize),
) -> BatchResult<R>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Send + 'static,
{
    let total = ids.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut join_set: JoinSet<(usize, Result<R>)> = JoinSet::new();

    for (index, id) in ids.iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let pending = fetch(id.clone());
        join_set.spawn(async move {
            let result = match semaphore.acquire().await {
                Ok(_permit) => pending.await,
                Err(_) => Err(Error::Other("worker pool closed unexpectedly".into())),
            };
            (index, result)
        });
    }

    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    let mut failures = 0;
    let mut fatal = None;
    let mut done = 0;

    while let Some(joined) = join_set.join_next().await {
        done += 1;
        match joined {
            Ok((index, Ok(value))) => results[index] = Some(value),
            Ok((index, Err(e))) => {
                failures += 1;
                log::warn!("Batch item {} failed: {e}", ids[index]);
                if e.is_fatal_for_run() && fatal.is_none() {
                    log::error!("Cancelling remaining batch items after: {e}");
                    join_set.abort_all();
                    fatal = Some(e);
                }
            }
            Err(e) if e.is_cancelled() => failures += 1,
            Err(e) => {
                failures += 1;
                log::error!("Batch worker panicked: {e}");
            }
        }
        on_done(done, total);
    }

    BatchResult {
        items: ids.iter().cloned().zip(results).collect(),
        failures,
        fatal,
    }
}

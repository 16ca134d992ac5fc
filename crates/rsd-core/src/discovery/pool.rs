use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::join_all;
use parking_lot::Mutex;

/// Run `f` over `items` with at most `limit` calls outstanding.
///
/// A fixed set of workers pulls the next index from a shared cursor, so the
/// number of live futures never exceeds `limit`. Results keep input order.
pub async fn map_limit<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let slots: Vec<Mutex<Option<T>>> = items.into_iter().map(|i| Mutex::new(Some(i))).collect();
    let results: Vec<Mutex<Option<R>>> = (0..total).map(|_| Mutex::new(None)).collect();
    let cursor = AtomicUsize::new(0);
    let workers = limit.clamp(1, total);

    join_all((0..workers).map(|_| drain(&cursor, &slots, &results, &f))).await;

    results
        .into_iter()
        .filter_map(|slot| slot.into_inner())
        .collect()
}

async fn drain<T, R, F, Fut>(
    cursor: &AtomicUsize,
    slots: &[Mutex<Option<T>>],
    results: &[Mutex<Option<R>>],
    f: &F,
) where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    loop {
        let idx = cursor.fetch_add(1, Ordering::SeqCst);
        if idx >= slots.len() {
            return;
        }
        let Some(item) = slots[idx].lock().take() else {
            continue;
        };
        let out = f(item).await;
        *results[idx].lock() = Some(out);
    }
}

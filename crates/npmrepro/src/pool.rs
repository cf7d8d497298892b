use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Runs `f` over `items` on at most `jobs` worker threads.
///
/// Workers pull the next index from a shared counter and run each item to completion
/// before taking another. Results come back in input order.
pub(crate) fn run_pool<T, R, F>(items: &[T], jobs: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::with_capacity(items.len()));

    std::thread::scope(|scope| {
        let jobs = jobs.max(1).min(items.len().max(1));
        for _ in 0..jobs {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= items.len() {
                    return;
                }
                let r = f(&items[idx]);
                if let Ok(mut guard) = results.lock() {
                    guard.push((idx, r));
                }
            });
        }
    });

    let mut out = results.into_inner().unwrap_or_else(|e| e.into_inner());
    out.sort_by_key(|(idx, _)| *idx);
    out.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    #[test]
    fn every_item_runs_once_and_order_is_kept() {
        let items: Vec<u64> = (0..23).collect();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let threads = Mutex::new(BTreeSet::new());

        let out = run_pool(&items, 4, |n| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            if let Ok(mut t) = threads.lock() {
                t.insert(format!("{:?}", std::thread::current().id()));
            }
            std::thread::sleep(Duration::from_millis(2 * (n % 3)));
            active.fetch_sub(1, Ordering::SeqCst);
            n * 10
        });

        assert_eq!(out, items.iter().map(|n| n * 10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(threads.lock().unwrap().len() <= 4);
    }

    #[test]
    fn empty_input_and_zero_jobs_are_fine() {
        let none: Vec<u8> = Vec::new();
        assert!(run_pool(&none, 5, |b| *b).is_empty());
        assert_eq!(run_pool(&[1u8, 2], 0, |b| *b + 1), vec![2, 3]);
    }
}

//! Single-flight call coalescing.
//!
//! At most one execution per key runs at a time; concurrent callers block
//! and share the leader's result. Used to deduplicate unpack work and size
//! computations per record id.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::CacheResult;

struct Call<V> {
    done: Mutex<Option<CacheResult<V>>>,
    cv: Condvar,
}

/// A group of single-flight keys.
pub struct Group<V> {
    calls: Mutex<HashMap<String, Arc<Call<V>>>>,
}

impl<V: Clone> Group<V> {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self { calls: Mutex::new(HashMap::new()) }
    }

    /// Runs `f` unless a call for `key` is already in flight, in which case
    /// the current thread waits for and shares that call's result.
    pub fn do_call<F>(&self, key: &str, f: F) -> CacheResult<V>
    where
        F: FnOnce() -> CacheResult<V>,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            match calls.get(key) {
                Some(call) => (call.clone(), false),
                None => {
                    let call = Arc::new(Call { done: Mutex::new(None), cv: Condvar::new() });
                    calls.insert(key.to_string(), call.clone());
                    (call, true)
                }
            }
        };

        if leader {
            let result = f();
            {
                let mut done = call.done.lock().unwrap_or_else(|e| e.into_inner());
                *done = Some(result.clone());
            }
            call.cv.notify_all();
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.remove(key);
            result
        } else {
            let mut done = call.done.lock().unwrap_or_else(|e| e.into_inner());
            while done.is_none() {
                done = call.cv.wait(done).unwrap_or_else(|e| e.into_inner());
            }
            done.clone().expect("flight result set before notify")
        }
    }
}

impl<V: Clone> Default for Group<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_caller_runs() {
        let g: Group<i64> = Group::new();
        assert_eq!(g.do_call("k", || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_concurrent_calls_coalesce() {
        let g: Arc<Group<usize>> = Arc::new(Group::new());
        let runs = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            let mut handles = Vec::new();
            for _ in 0..8 {
                let g = g.clone();
                let runs = runs.clone();
                handles.push(s.spawn(move || {
                    g.do_call("k", || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(42)
                    })
                    .unwrap()
                }));
            }
            for h in handles {
                assert_eq!(h.join().unwrap(), 42);
            }
        });
        // all 8 threads racing on the same key run the body at most twice
        // (a second run can start only after the first fully completes)
        assert!(runs.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_errors_are_shared() {
        let g: Group<i64> = Group::new();
        let err = g
            .do_call("k", || Err(crate::error::CacheError::Cancelled))
            .unwrap_err();
        assert!(matches!(err, crate::error::CacheError::Cancelled));
        // key is cleared after failure; next call runs again
        assert_eq!(g.do_call("k", || Ok(1)).unwrap(), 1);
    }

    #[test]
    fn test_distinct_keys_run_independently() {
        let g: Group<i64> = Group::new();
        assert_eq!(g.do_call("a", || Ok(1)).unwrap(), 1);
        assert_eq!(g.do_call("b", || Ok(2)).unwrap(), 2);
    }
}

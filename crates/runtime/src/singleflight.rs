use futures_util::future::{BoxFuture, FutureExt, Shared};
use hearth_core::{BackendError, RuntimeError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

type Flight<T> = Shared<BoxFuture<'static, Result<T, RuntimeError>>>;

/// At most one in-flight computation per key. Later callers for the same key
/// join the running one and receive a clone of its result.
///
/// The work runs on its own task, so it finishes even if every caller stops
/// waiting.
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    flights: Arc<Mutex<HashMap<String, (u64, Flight<T>)>>>,
    next_id: Mutex<u64>,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: Mutex::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` for `key` unless a run is already in flight. The flag is
    /// true for the caller that started the work.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Result<T, RuntimeError>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>> + Send + 'static,
    {
        let (flight, leader) = {
            let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
            match flights.get(key) {
                Some((_, flight)) => (flight.clone(), false),
                None => {
                    let id = {
                        let mut next = self.next_id.lock().unwrap_or_else(|p| p.into_inner());
                        *next += 1;
                        *next
                    };
                    let flight = self.spawn(key.to_string(), id, work());
                    flights.insert(key.to_string(), (id, flight.clone()));
                    (flight, true)
                }
            }
        };
        (flight.await, leader)
    }

    pub fn in_flight(&self, key: &str) -> bool {
        self.flights
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(key)
    }

    fn spawn<Fut>(&self, key: String, id: u64, work: Fut) -> Flight<T>
    where
        Fut: Future<Output = Result<T, RuntimeError>> + Send + 'static,
    {
        let flights = Arc::clone(&self.flights);
        let handle = tokio::spawn(async move {
            let result = work.await;
            let mut flights = flights.lock().unwrap_or_else(|p| p.into_inner());
            if flights.get(&key).is_some_and(|(current, _)| *current == id) {
                flights.remove(&key);
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(RuntimeError::Backend(BackendError::other(format!(
                    "load task aborted: {}",
                    e
                )))),
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                flights
                    .run("m1", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for task in tasks {
            let (result, leader) = task.await.unwrap();
            assert_eq!(result.unwrap(), 7);
            if leader {
                leaders += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert!(!flights.in_flight("m1"));
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let flights = SingleFlight::<u32>::new();
        let (result, _) = flights
            .run("m1", || async { Err(RuntimeError::not_found("m1")) })
            .await;
        assert!(matches!(result, Err(RuntimeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_work_completes_after_caller_gives_up() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let done = Arc::new(AtomicUsize::new(0));

        let marker = done.clone();
        let waiting = flights.run("m1", move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            marker.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        let _ = tokio::time::timeout(Duration::from_millis(5), waiting).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flights.in_flight("m1"));
    }
}

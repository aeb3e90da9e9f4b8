//! Call collapsing.
//!
//! [`SingleFlight::run`] lets concurrent callers share one in-flight
//! computation. The first caller starts it, later callers await the same
//! future, and everyone receives a clone of its output. Once it completes the
//! slot is cleared so the next call starts fresh.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

type Flight<T> = (u64, Shared<BoxFuture<'static, T>>);

/// Collapses concurrent calls into one.
pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    slot: Mutex<Option<Flight<T>>>,
    generation: AtomicU64,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }
}

impl<T> std::fmt::Debug for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.slot.lock().is_some())
            .finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an idle instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make` unless a call is already in flight, then await the shared result.
    pub async fn run<F, Fut>(&self, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (generation, flight) = {
            let mut slot = self.slot.lock();
            if let Some((generation, flight)) = slot.as_ref() {
                (*generation, flight.clone())
            } else {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let flight = make().boxed().shared();
                *slot = Some((generation, flight.clone()));
                (generation, flight)
            }
        };

        let output = flight.await;

        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|(current, _)| *current == generation) {
            *slot = None;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let flight = Arc::new(SingleFlight::<Result<u32, String>>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    flight
                        .run(move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(7)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flight = SingleFlight::<Result<u32, String>>::new();
        assert_eq!(flight.run(|| async { Err("down".to_string()) }).await, Err("down".to_string()));
        assert_eq!(flight.run(|| async { Ok(1) }).await, Ok(1));
    }
}

//! Bounded, fail-fast execution of independent units.

use std::future::Future;

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

use crate::{Cancellation, TaskPoolError};

/// Runs units on separate tasks with at most `max_in_flight` at once.
///
/// The submitter blocks only while the pool is saturated. Cancellation is
/// checked before each launch. After the first failure no further unit is
/// admitted; units already running are allowed to finish and the first
/// error is returned unchanged.
#[derive(Debug, Clone)]
pub struct TaskPool {
    max_in_flight: usize,
    cancellation: Cancellation,
}

impl TaskPool {
    pub fn new(max_in_flight: usize, cancellation: Cancellation) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            cancellation,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Run every unit and collect outputs in submission order.
    pub async fn process_all<I, F, T, E>(&self, units: I) -> Result<Vec<T>, TaskPoolError<E>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut set = JoinSet::new();
        let mut outputs: Vec<(usize, T)> = Vec::new();
        let mut failure: Option<TaskPoolError<E>> = None;

        for (idx, unit) in units.into_iter().enumerate() {
            while set.len() >= self.max_in_flight {
                match set.join_next().await {
                    Some(joined) => collect(joined, &mut outputs, &mut failure),
                    None => break,
                }
            }
            if failure.is_some() {
                break;
            }
            if self.cancellation.is_cancelled() {
                failure = Some(TaskPoolError::Cancelled);
                break;
            }

            debug!(unit = idx, in_flight = set.len() + 1, "launching unit");
            set.spawn(async move { (idx, unit.await) });
        }

        while let Some(joined) = set.join_next().await {
            collect(joined, &mut outputs, &mut failure);
        }

        if let Some(err) = failure {
            return Err(err);
        }
        outputs.sort_by_key(|(idx, _)| *idx);
        Ok(outputs.into_iter().map(|(_, out)| out).collect())
    }
}

fn collect<T, E: std::fmt::Display>(
    joined: Result<(usize, Result<T, E>), JoinError>,
    outputs: &mut Vec<(usize, T)>,
    failure: &mut Option<TaskPoolError<E>>,
) {
    match joined {
        Ok((idx, Ok(out))) => outputs.push((idx, out)),
        Ok((idx, Err(err))) => {
            warn!(unit = idx, error = %err, "unit failed");
            if failure.is_none() {
                *failure = Some(TaskPoolError::Unit(err));
            }
        }
        Err(join_err) => {
            warn!(error = %join_err, "unit did not complete");
            if failure.is_none() {
                *failure = Some(TaskPoolError::Panicked(join_err.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_capacity() {
        let pool = TaskPool::new(2, Cancellation::never());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let units = (0..4).map(|i| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i)
            }
        });

        let out = pool.process_all(units).await.unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stops_admitting_after_first_failure() {
        let pool = TaskPool::new(1, Cancellation::never());
        let started = Arc::new(AtomicUsize::new(0));

        let units = (0..5).map(|i| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if i == 3 {
                    Err(format!("unit {} failed", i))
                } else {
                    Ok(i)
                }
            }
        });

        let err = pool.process_all(units).await.unwrap_err();
        assert!(matches!(err, TaskPoolError::Unit(ref msg) if msg == "unit 3 failed"));
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_units_finish_after_failure() {
        let pool = TaskPool::new(3, Cancellation::never());
        let finished = Arc::new(AtomicUsize::new(0));

        let units = (0..6).map(|i| {
            let finished = finished.clone();
            async move {
                if i == 0 {
                    return Err("boom".to_string());
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            }
        });

        let err = pool.process_all(units).await.unwrap_err();
        assert!(matches!(err, TaskPoolError::Unit(_)));
        // Units 1 and 2 were already in flight when unit 0 failed.
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_launch() {
        let (handle, cancellation) = Cancellation::pair();
        handle.cancel();
        let pool = TaskPool::new(4, cancellation);
        let started = Arc::new(AtomicUsize::new(0));

        let units = (0..3).map(|_| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        });

        let err = pool.process_all(units).await.unwrap_err();
        assert!(matches!(err, TaskPoolError::Cancelled));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_unit_is_reported() {
        let pool = TaskPool::new(2, Cancellation::never());
        let units = (0..2).map(|i| async move {
            if i == 1 {
                panic!("unit panicked");
            }
            Ok::<_, String>(i)
        });

        let err = pool.process_all(units).await.unwrap_err();
        assert!(matches!(err, TaskPoolError::Panicked(_)));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(TaskPool::new(0, Cancellation::never()).max_in_flight(), 1);
    }
}

//! A lock-guarded sketch handle for concurrent callers.
//!
//! [`SharedSketch`] owns at most one sketch together with the configuration
//! it was built from. Every operation takes the same mutex, so updates,
//! merges and queries on one handle are serialized. A reset builds the new
//! sketch before taking the lock and swaps it in whole.

use std::convert::TryFrom;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{CountMin, Estimator, SketchConfig, SketchError, UpdatePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub key: i64,
    #[serde(default = "default_increment")]
    pub c:   i64,
}

impl UpdateRequest {
    pub fn new(key: i64, c: i64) -> Self {
        UpdateRequest { key, c }
    }
}

fn default_increment() -> i64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReceipt {
    pub total_updates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub applied:       usize,
    pub total_updates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub key:           i64,
    pub estimator:     Estimator,
    pub estimate:      f64,
    pub total_updates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub eps:           f64,
    pub delta:         f64,
    pub seed:          u64,
    pub width:         usize,
    pub depth:         usize,
    pub policy:        UpdatePolicy,
    pub total_updates: u64,
}

#[derive(Debug)]
struct Slot {
    config: SketchConfig,
    sketch: CountMin,
}

impl Slot {
    fn apply(&mut self, key: u64, c: u64) -> Result<(), SketchError> {
        self.sketch.update_with(key, c, self.config.policy)
    }
}

/// One sketch shared behind a mutex.
#[derive(Debug, Default)]
pub struct SharedSketch {
    slot: Mutex<Option<Slot>>,
}

impl SharedSketch {
    pub fn new(config: SketchConfig) -> Result<Self, SketchError> {
        let shared = SharedSketch::uninitialized();

        shared.reset(config)?;

        Ok(shared)
    }

    /// A handle without a sketch. Every operation but [`reset`] fails with
    /// [`SketchError::Uninitialized`] until one is installed.
    ///
    /// [`reset`]: SharedSketch::reset
    pub fn uninitialized() -> Self {
        SharedSketch {
            slot: Mutex::new(None),
        }
    }

    /// Replaces the served sketch with an empty one built from `config`.
    ///
    /// On invalid parameters the current sketch keeps serving.
    pub fn reset(&self, config: SketchConfig) -> Result<(), SketchError> {
        let sketch = config.validate().and_then(|_| config.build());

        let sketch = match sketch {
            Ok(sketch) => sketch,
            Err(err) => {
                warn!(eps = config.eps, delta = config.delta, "rejected sketch reset");
                return Err(err);
            },
        };

        info!(
            eps = config.eps,
            delta = config.delta,
            seed = config.seed,
            policy = %config.policy,
            width = sketch.width(),
            depth = sketch.depth(),
            "sketch reset"
        );

        *self.lock() = Some(Slot { config, sketch });

        Ok(())
    }

    /// Applies one increment under the configured policy.
    pub fn update(&self, key: i64, c: i64) -> Result<UpdateReceipt, SketchError> {
        let c = increment(c)?;

        self.with_slot(|slot| {
            slot.apply(key as u64, c)?;

            Ok(UpdateReceipt {
                total_updates: slot.sketch.total_updates(),
            })
        })
    }

    /// Applies `updates` in order under a single lock acquisition.
    ///
    /// Every increment is validated before any is applied. A counter
    /// overflow stops the batch; updates before it stay applied.
    pub fn batch_update(
        &self,
        updates: &[UpdateRequest],
    ) -> Result<BatchReceipt, SketchError> {
        let updates = updates
            .iter()
            .map(|u| Ok((u.key as u64, increment(u.c)?)))
            .collect::<Result<Vec<(u64, u64)>, SketchError>>()?;

        self.with_slot(|slot| {
            for (key, c) in updates.iter() {
                slot.apply(*key, *c)?;
            }

            Ok(BatchReceipt {
                applied:       updates.len(),
                total_updates: slot.sketch.total_updates(),
            })
        })
    }

    pub fn query(
        &self,
        key: i64,
        estimator: Estimator,
    ) -> Result<QueryResponse, SketchError> {
        self.with_slot(|slot| {
            Ok(QueryResponse {
                key,
                estimator,
                estimate: slot.sketch.query(key as u64, estimator),
                total_updates: slot.sketch.total_updates(),
            })
        })
    }

    pub fn stats(&self) -> Result<Stats, SketchError> {
        self.with_slot(|slot| {
            Ok(Stats {
                eps:           slot.config.eps,
                delta:         slot.config.delta,
                seed:          slot.config.seed,
                width:         slot.sketch.width(),
                depth:         slot.sketch.depth(),
                policy:        slot.config.policy,
                total_updates: slot.sketch.total_updates(),
            })
        })
    }

    /// Merges `other` into the served sketch. `other` must come from the
    /// same `(eps, delta, seed)`.
    pub fn merge_from(&self, other: &CountMin) -> Result<(), SketchError> {
        self.with_slot(|slot| {
            if slot.config.policy == UpdatePolicy::Conservative {
                warn!("merging into a conservative-update sketch is approximate");
            }

            slot.sketch.merge_in_place(other)
        })
    }

    /// A copy of the served sketch.
    pub fn snapshot(&self) -> Result<CountMin, SketchError> {
        self.with_slot(|slot| Ok(slot.sketch.clone()))
    }

    fn with_slot<T, F>(&self, f: F) -> Result<T, SketchError>
    where
        F: FnOnce(&mut Slot) -> Result<T, SketchError>,
    {
        let mut guard = self.lock();

        let result = match guard.as_mut() {
            Some(slot) => f(slot),
            None => Err(SketchError::Uninitialized),
        };

        if let Err(err) = &result {
            warn!(%err, "sketch operation rejected");
        }

        result
    }

    // Operations validate before they write, so a sketch behind a poisoned
    // lock is still consistent.
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn increment(c: i64) -> Result<u64, SketchError> {
    u64::try_from(c).map_err(|_| SketchError::InvalidIncrement)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    fn config(policy: UpdatePolicy) -> SketchConfig {
        SketchConfig::new(0.01, 0.01, 3, policy)
    }

    #[test]
    fn test_uninitialized() {
        let shared = SharedSketch::uninitialized();

        assert_eq!(shared.update(1, 1), Err(SketchError::Uninitialized));
        assert_eq!(
            shared.batch_update(&[UpdateRequest::new(1, 1)]),
            Err(SketchError::Uninitialized)
        );
        assert_eq!(
            shared.query(1, Estimator::Min),
            Err(SketchError::Uninitialized)
        );
        assert_eq!(shared.stats(), Err(SketchError::Uninitialized));
        assert_eq!(shared.snapshot().err(), Some(SketchError::Uninitialized));

        shared.reset(config(UpdatePolicy::Baseline)).unwrap();

        assert_eq!(shared.update(1, 1), Ok(UpdateReceipt { total_updates: 1 }));
    }

    #[test]
    fn test_update_and_query() {
        let shared = SharedSketch::new(config(UpdatePolicy::Baseline)).unwrap();

        assert_eq!(shared.update(-7, 3).unwrap().total_updates, 3);
        assert_eq!(shared.update(-7, 0).unwrap().total_updates, 3);
        assert_eq!(shared.update(-7, -1), Err(SketchError::InvalidIncrement));

        let response = shared.query(-7, Estimator::Min).unwrap();

        assert_eq!(response.key, -7);
        assert_eq!(response.estimator, Estimator::Min);
        assert_eq!(response.estimate, 3.0);
        assert_eq!(response.total_updates, 3);

        let snapshot = shared.snapshot().unwrap();

        assert_eq!(snapshot.query_min(-7i64 as u64), 3);
    }

    #[test]
    fn test_batch_update() {
        let shared =
            SharedSketch::new(config(UpdatePolicy::Conservative)).unwrap();

        let batch: Vec<UpdateRequest> =
            (0..100).map(|k| UpdateRequest::new(k % 10, 2)).collect();

        assert_eq!(
            shared.batch_update(&batch),
            Ok(BatchReceipt {
                applied:       100,
                total_updates: 200,
            })
        );

        for key in 0..10 {
            let estimate = shared.query(key, Estimator::Min).unwrap().estimate;

            assert!(estimate >= 20.0);
        }

        // One bad increment rejects the whole batch.
        let batch = vec![UpdateRequest::new(1, 1), UpdateRequest::new(2, -1)];

        assert_eq!(
            shared.batch_update(&batch),
            Err(SketchError::InvalidIncrement)
        );
        assert_eq!(shared.stats().unwrap().total_updates, 200);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let batched =
            SharedSketch::new(config(UpdatePolicy::Conservative)).unwrap();
        let single =
            SharedSketch::new(config(UpdatePolicy::Conservative)).unwrap();

        let batch: Vec<UpdateRequest> = (0..500)
            .map(|i| UpdateRequest::new((i * 7919) % 300, 1 + i % 3))
            .collect();

        batched.batch_update(&batch).unwrap();

        for u in batch.iter() {
            single.update(u.key, u.c).unwrap();
        }

        assert_eq!(batched.snapshot().unwrap(), single.snapshot().unwrap());
    }

    #[test]
    fn test_reset_and_stats() {
        let shared = SharedSketch::new(config(UpdatePolicy::Baseline)).unwrap();

        shared.update(1, 5).unwrap();

        assert_eq!(
            shared.stats().unwrap(),
            Stats {
                eps:           0.01,
                delta:         0.01,
                seed:          3,
                width:         272,
                depth:         5,
                policy:        UpdatePolicy::Baseline,
                total_updates: 5,
            }
        );

        // A rejected reset leaves the old sketch serving.
        assert_eq!(
            shared.reset(SketchConfig::new(1.5, 0.01, 3, UpdatePolicy::Baseline)),
            Err(SketchError::InvalidParameter)
        );
        assert_eq!(shared.stats().unwrap().total_updates, 5);

        shared
            .reset(SketchConfig::new(0.001, 0.001, 1, UpdatePolicy::Conservative))
            .unwrap();

        let stats = shared.stats().unwrap();

        assert_eq!((stats.width, stats.depth), (2719, 7));
        assert_eq!(stats.policy, UpdatePolicy::Conservative);
        assert_eq!(stats.total_updates, 0);
    }

    #[test]
    fn test_merge_from() {
        let shared = SharedSketch::new(config(UpdatePolicy::Baseline)).unwrap();

        let mut other = config(UpdatePolicy::Baseline).build().unwrap();

        other.update(9, 4).unwrap();
        shared.update(9, 1).unwrap();

        shared.merge_from(&other).unwrap();

        assert_eq!(shared.query(9, Estimator::Min).unwrap().estimate, 5.0);
        assert_eq!(shared.stats().unwrap().total_updates, 5);

        let foreign = SketchConfig::new(0.01, 0.01, 4, UpdatePolicy::Baseline)
            .build()
            .unwrap();

        assert_eq!(
            shared.merge_from(&foreign),
            Err(SketchError::IncompatibleSketch)
        );
    }

    #[test]
    fn test_concurrent_updates() {
        let shared =
            Arc::new(SharedSketch::new(config(UpdatePolicy::Baseline)).unwrap());

        let threads: Vec<thread::JoinHandle<()>> = (0..8)
            .map(|t| {
                let shared = Arc::clone(&shared);

                thread::spawn(move || {
                    for i in 0..1000 {
                        shared.update(i % 50, 1).unwrap();
                    }

                    shared.update(1_000 + t, 10).unwrap();
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(shared.stats().unwrap().total_updates, 8 * 1000 + 80);

        for key in 0..50 {
            assert!(shared.query(key, Estimator::Min).unwrap().estimate >= 160.0);
        }
    }

    #[test]
    fn test_wire_shapes() {
        let request: UpdateRequest = serde_json::from_str(r#"{"key": -3}"#).unwrap();

        assert_eq!(request, UpdateRequest::new(-3, 1));

        let response = QueryResponse {
            key:           5,
            estimator:     Estimator::CountMeanMin,
            estimate:      2.5,
            total_updates: 10,
        };

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({
                "key": 5,
                "estimator": "cmm",
                "estimate": 2.5,
                "total_updates": 10,
            })
        );
    }
}

//! A Count-Min sketch for summarizing high-throughput integer key streams.
//!
//! Count-Min is a *sublinear space* data structure for approximating item
//! frequencies. Originally, it was proposed by G. Cormode et al. in
//! *An Improved Data Stream Summary: The Count-Min Sketch and its
//! Applications.*.
//!
//! This crate provides:
//!
//! * [`CountMin`], the sketch itself: sizing from `(eps, delta)`, baseline
//!   and conservative updates, the min, mean and count-mean-min estimators,
//!   and merging.
//! * [`SharedSketch`], a lock-guarded handle that serializes access to one
//!   sketch for concurrent callers and swaps in fresh sketches atomically.
//!
//! ```
//! use cmstream::{CountMin, Estimator};
//!
//! let mut cms: CountMin = CountMin::from_error_bounds(0.001, 0.001, 7).unwrap();
//!
//! cms.update(42, 3).unwrap();
//! cms.update_conservative(42, 2).unwrap();
//!
//! assert!(cms.query_min(42) >= 5);
//! assert!(cms.query(42, Estimator::Mean) >= 5.0);
//! ```

use std::error::Error;
use std::fmt;

mod config;
mod countmin;
pub mod hash;
mod service;

pub use config::SketchConfig;
pub use countmin::{CountMin, Estimator, UpdatePolicy};
pub use service::{
    BatchReceipt, QueryResponse, SharedSketch, Stats, UpdateReceipt,
    UpdateRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchError {
    /// `eps`, `delta`, dimensions or a named option are out of range.
    InvalidParameter,
    /// A negative increment; the sketch is insert-only.
    InvalidIncrement,
    /// Merge across sketches with different dimensions or seeds.
    IncompatibleSketch,
    /// A counter would exceed the range of its integer type.
    CounterOverflow,
    /// The shared handle holds no sketch yet.
    Uninitialized,
}

impl fmt::Display for SketchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SketchError::InvalidParameter => "invalid parameter.".fmt(f),
            SketchError::InvalidIncrement => "invalid increment.".fmt(f),
            SketchError::IncompatibleSketch => "incompatible sketch.".fmt(f),
            SketchError::CounterOverflow => "counter overflow.".fmt(f),
            SketchError::Uninitialized => "sketch not initialized.".fmt(f),
        }
    }
}

impl Error for SketchError {}

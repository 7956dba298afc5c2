use std::cmp;
use std::fmt;
use std::mem;
use std::str::FromStr;

use num_traits::{CheckedAdd, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hash;
use crate::SketchError;

/// How an update distributes its increment over the key's row buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Every row bucket of the key is raised by the increment.
    Baseline,
    /// Only the row buckets currently holding the key's minimum are raised.
    #[serde(alias = "cu")]
    Conservative,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        UpdatePolicy::Baseline
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePolicy::Baseline => "baseline".fmt(f),
            UpdatePolicy::Conservative => "conservative".fmt(f),
        }
    }
}

impl FromStr for UpdatePolicy {
    type Err = SketchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(UpdatePolicy::Baseline),
            "conservative" | "cu" => Ok(UpdatePolicy::Conservative),
            _ => Err(SketchError::InvalidParameter),
        }
    }
}

/// Point estimators over a key's row buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Estimator {
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "mean")]
    Mean,
    #[serde(rename = "cmm", alias = "count_mean_min")]
    CountMeanMin,
}

impl Default for Estimator {
    fn default() -> Self {
        Estimator::Min
    }
}

impl fmt::Display for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimator::Min => "min".fmt(f),
            Estimator::Mean => "mean".fmt(f),
            Estimator::CountMeanMin => "cmm".fmt(f),
        }
    }
}

impl FromStr for Estimator {
    type Err = SketchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(Estimator::Min),
            "mean" => Ok(Estimator::Mean),
            "cmm" | "count_mean_min" => Ok(Estimator::CountMeanMin),
            _ => Err(SketchError::InvalidParameter),
        }
    }
}

/// A `depth x width` Count-Min sketch over 64-bit keys.
///
/// Counters, row totals and the update total share the integer type `C`.
/// Every addition is checked: an update or merge that would overflow `C`
/// fails with [`SketchError::CounterOverflow`] and leaves the sketch as it
/// was.
///
/// Row `r` keeps `row_totals[r]` equal to the sum of its counters at all
/// times. `total_updates` is the sum of the increments callers asked for,
/// which under conservative update differs from any row total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountMin<C = u64> {
    width:         usize,
    depth:         usize,
    seeds:         Vec<u64>,
    counts:        Vec<C>,
    row_totals:    Vec<C>,
    total_updates: C,
}

impl<C> CountMin<C>
where
    C: Copy + Zero + PartialOrd + CheckedAdd + ToPrimitive,
{
    /// Sizes the sketch so that, with probability `1 - delta`, the min
    /// estimate exceeds the true count by at most `eps * total_updates`.
    ///
    /// `width = ceil(e / eps)` and `depth = ceil(ln(1 / delta))`. Both
    /// parameters must lie strictly inside `(0, 1)`.
    pub fn from_error_bounds(
        eps: f64,
        delta: f64,
        seed: u64,
    ) -> Result<Self, SketchError> {
        if !(eps > 0.0 && eps < 1.0) || !(delta > 0.0 && delta < 1.0) {
            return Err(SketchError::InvalidParameter);
        }

        let width = (std::f64::consts::E / eps).ceil();

        if width > isize::MAX as f64 {
            return Err(SketchError::InvalidParameter);
        }

        Self::with_dimensions_from_seed(
            width as usize,
            (1.0 / delta).ln().ceil() as usize,
            seed,
        )
    }

    /// Builds a zeroed sketch with explicit dimensions. The row seeds are
    /// drawn from a ChaCha stream keyed by `seed`, so equal arguments always
    /// produce sketches that hash identically.
    pub fn with_dimensions_from_seed(
        width: usize,
        depth: usize,
        seed: u64,
    ) -> Result<Self, SketchError> {
        if width < 1 || depth < 1 {
            return Err(SketchError::InvalidParameter);
        }

        let cells = width
            .checked_mul(depth)
            .filter(|cells| {
                cells
                    .checked_mul(mem::size_of::<C>())
                    .map_or(false, |bytes| bytes <= isize::MAX as usize)
            })
            .ok_or(SketchError::InvalidParameter)?;

        debug!(width, depth, seed, "allocating count-min sketch");

        let mut counts = Vec::new();

        counts
            .try_reserve_exact(cells)
            .map_err(|_| SketchError::InvalidParameter)?;
        counts.resize(cells, C::zero());

        Ok(CountMin {
            width:         width,
            depth:         depth,
            seeds:         hash::row_seeds(depth, seed),
            counts:        counts,
            row_totals:    vec![C::zero(); depth],
            total_updates: C::zero(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    pub fn row_totals(&self) -> &[C] {
        &self.row_totals
    }

    /// Sum of all increments passed to the update methods, plus the totals of
    /// merged sketches.
    pub fn total_updates(&self) -> C {
        self.total_updates
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|c| c.is_zero())
    }

    /// Adds `c` to every row bucket of `key`.
    pub fn update(&mut self, key: u64, c: C) -> Result<(), SketchError> {
        Self::check_increment(c)?;

        if c.is_zero() {
            return Ok(());
        }

        let total = self.checked_total(c)?;

        // A counter never exceeds its row total, so headroom in the totals
        // covers the counters as well.
        for row in 0..self.depth {
            Self::checked(self.row_totals[row], c)?;
        }

        for row in 0..self.depth {
            let index = self.index(row, key);

            self.counts[index] = self.counts[index] + c;
            self.row_totals[row] = self.row_totals[row] + c;
        }

        self.total_updates = total;

        Ok(())
    }

    /// Adds `c` only to the row buckets of `key` that currently hold its
    /// minimum. All tied rows are raised.
    ///
    /// The result depends on the order of updates, and sketches built this
    /// way no longer merge exactly (see [`merge_in_place`]).
    ///
    /// [`merge_in_place`]: CountMin::merge_in_place
    pub fn update_conservative(
        &mut self,
        key: u64,
        c: C,
    ) -> Result<(), SketchError> {
        Self::check_increment(c)?;

        if c.is_zero() {
            return Ok(());
        }

        let total = self.checked_total(c)?;
        let min = self.query_min(key);

        for row in 0..self.depth {
            if self.counts[self.index(row, key)] == min {
                Self::checked(self.row_totals[row], c)?;
            }
        }

        // Each row is visited once, so a raised bucket is never compared
        // against the minimum again.
        for row in 0..self.depth {
            let index = self.index(row, key);

            if self.counts[index] == min {
                self.counts[index] = self.counts[index] + c;
                self.row_totals[row] = self.row_totals[row] + c;
            }
        }

        self.total_updates = total;

        Ok(())
    }

    pub fn update_with(
        &mut self,
        key: u64,
        c: C,
        policy: UpdatePolicy,
    ) -> Result<(), SketchError> {
        match policy {
            UpdatePolicy::Baseline => self.update(key, c),
            UpdatePolicy::Conservative => self.update_conservative(key, c),
        }
    }

    /// Smallest row bucket of `key`. Never below the true count.
    pub fn query_min(&self, key: u64) -> C {
        let first = self.counts[self.index(0, key)];

        (1..self.depth)
            .map(|row| self.counts[self.index(row, key)])
            .fold(first, |min, v| if v < min { v } else { min })
    }

    /// Arithmetic mean of the row buckets of `key`.
    pub fn query_mean(&self, key: u64) -> f64 {
        let sum: f64 = (0..self.depth)
            .map(|row| as_f64(self.counts[self.index(row, key)]))
            .sum();

        sum / self.depth as f64
    }

    /// Count-mean-min estimate of `key`.
    ///
    /// Each row bucket is reduced by the mass the rest of the row would put
    /// in it if spread uniformly, `(row_total - v) / max(1, width - 1)`,
    /// clamped at zero, and the smallest reduced value is returned. This can
    /// fall below the true count.
    ///
    /// The noise model assumes baseline accumulation. After conservative
    /// updates the row totals are uneven across keys and the result is only
    /// an approximation.
    pub fn query_count_mean_min(&self, key: u64) -> f64 {
        let spread = cmp::max(1, self.width - 1) as f64;

        (0..self.depth)
            .map(|row| {
                let v = as_f64(self.counts[self.index(row, key)]);
                let noise = (as_f64(self.row_totals[row]) - v) / spread;

                (v - noise).max(0.0)
            })
            .fold(f64::INFINITY, f64::min)
    }

    pub fn query(&self, key: u64, estimator: Estimator) -> f64 {
        match estimator {
            Estimator::Min => as_f64(self.query_min(key)),
            Estimator::Mean => self.query_mean(key),
            Estimator::CountMeanMin => self.query_count_mean_min(key),
        }
    }

    /// Adds `other` into `self` cell by cell.
    ///
    /// Exact for sketches fed only baseline updates: the result equals a
    /// single sketch fed both streams. Conservative update is not linear, so
    /// merging such sketches only approximates the conservative sketch of the
    /// combined stream.
    pub fn merge_in_place(
        &mut self,
        other: &CountMin<C>,
    ) -> Result<(), SketchError> {
        self.check_compatible_with(other)?;

        let total = self.checked_total(other.total_updates)?;

        let cells = self.counts.iter().zip(other.counts.iter());
        let rows = self.row_totals.iter().zip(other.row_totals.iter());

        for (x, y) in cells.chain(rows) {
            Self::checked(*x, *y)?;
        }

        self.counts
            .iter_mut()
            .zip(other.counts.iter())
            .for_each(|(x, y)| *x = *x + *y);

        self.row_totals
            .iter_mut()
            .zip(other.row_totals.iter())
            .for_each(|(x, y)| *x = *x + *y);

        self.total_updates = total;

        debug!(width = self.width, depth = self.depth, "merged count-min sketch");

        Ok(())
    }

    /// Sketches are compatible when their dimensions and row seeds match.
    pub fn check_compatible_with(
        &self,
        other: &CountMin<C>,
    ) -> Result<(), SketchError> {
        if self.width != other.width
            || self.depth != other.depth
            || self.counts.len() != other.counts.len()
            || self.row_totals.len() != other.row_totals.len()
            || self.seeds != other.seeds
        {
            return Err(SketchError::IncompatibleSketch);
        }

        Ok(())
    }

    #[inline]
    fn index(&self, row: usize, key: u64) -> usize {
        row * self.width + hash::multiply_shift(key, self.seeds[row], self.width)
    }

    fn check_increment(c: C) -> Result<(), SketchError> {
        if c < C::zero() {
            return Err(SketchError::InvalidIncrement);
        }

        Ok(())
    }

    fn checked_total(&self, c: C) -> Result<C, SketchError> {
        Self::checked(self.total_updates, c)
    }

    #[inline]
    fn checked(a: C, b: C) -> Result<C, SketchError> {
        a.checked_add(&b).ok_or(SketchError::CounterOverflow)
    }
}

#[inline]
fn as_f64<C: ToPrimitive>(c: C) -> f64 {
    c.to_f64().unwrap_or(f64::NAN)
}

//! Resource vectors.
//!
//! A [`ResourceVector`] maps resource names (`cpu`, `user_slots`, `memory`,
//! `network`, `gpu`, or anything else) to non-negative amounts. Missing keys
//! read as zero, so vectors with different key sets combine freely. Every
//! operation is total: nothing here panics or returns an error.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// Relative tolerance for floating-point comparisons.
pub const EPSILON: f64 = 1e-9;

/// Resource used to break ties between equally dominant resources.
pub const MAIN_RESOURCE: &str = "cpu";

pub const CPU: &str = "cpu";
pub const USER_SLOTS: &str = "user_slots";
pub const MEMORY: &str = "memory";
pub const NETWORK: &str = "network";
pub const GPU: &str = "gpu";

/// `|a - b| <= ε·max(1, |a|, |b|)`.
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPSILON * 1f64.max(a.abs()).max(b.abs())
}

/// `a <= b` up to [`EPSILON`].
pub fn approx_le(a: f64, b: f64) -> bool {
    a <= b || approx_eq(a, b)
}

/// Typed bag of named, non-negative resource amounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector {
    values: BTreeMap<String, f64>,
}

impl ResourceVector {
    /// The empty (all-zero) vector.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build a vector from `(name, amount)` pairs. Negative amounts clamp to 0.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut v = Self::zero();
        for (name, amount) in pairs {
            v.set(name, amount);
        }
        v
    }

    /// Shorthand for a cpu-only vector.
    pub fn cpu(amount: f64) -> Self {
        Self::from_pairs([(CPU, amount)])
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, amount: f64) -> Self {
        self.set(name, amount);
        self
    }

    pub fn get(&self, name: &str) -> f64 {
        self.values.get(name).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, name: &str, amount: f64) {
        let amount = if amount.is_finite() { amount.max(0.0) } else { 0.0 };
        if amount == 0.0 {
            self.values.remove(name);
        } else {
            self.values.insert(name.to_string(), amount);
        }
    }

    /// Resource names with a non-zero amount.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn union_names<'a>(&'a self, other: &'a Self) -> Vec<&'a str> {
        let mut names: Vec<&str> = self.names().chain(other.names()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Self {
        let mut out = Self::zero();
        for name in self.union_names(other) {
            out.set(name, f(self.get(name), other.get(name)));
        }
        out
    }

    pub fn add(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a + b)
    }

    /// Component-wise subtraction clamped at zero.
    pub fn sub_saturating(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| {
            let d = a - b;
            if d <= EPSILON * 1f64.max(a.abs()) { 0.0 } else { d }
        })
    }

    pub fn scale(&self, factor: f64) -> Self {
        let factor = if factor.is_finite() { factor.max(0.0) } else { 0.0 };
        let mut out = Self::zero();
        for (name, v) in self.iter() {
            out.set(name, v * factor);
        }
        out
    }

    pub fn min(&self, other: &Self) -> Self {
        self.zip_with(other, f64::min)
    }

    pub fn max(&self, other: &Self) -> Self {
        self.zip_with(other, f64::max)
    }

    /// `max_i self_i / total_i` over resources present in `total`.
    ///
    /// Resources the cluster does not have at all are ignored.
    pub fn dominant(&self, total: &Self) -> f64 {
        self.iter()
            .filter_map(|(name, v)| {
                let t = total.get(name);
                (t > 0.0).then(|| v / t)
            })
            .fold(0.0, f64::max)
    }

    /// Name of the resource attaining [`dominant`](Self::dominant).
    ///
    /// Ties go to [`MAIN_RESOURCE`], then to name order.
    pub fn dominant_resource(&self, total: &Self) -> Option<String> {
        let best = self.dominant(total);
        if best <= 0.0 {
            return None;
        }
        let candidates: Vec<&str> = self
            .iter()
            .filter(|(name, v)| {
                let t = total.get(name);
                t > 0.0 && approx_eq(v / t, best)
            })
            .map(|(name, _)| name)
            .collect();
        if candidates.contains(&MAIN_RESOURCE) {
            return Some(MAIN_RESOURCE.to_string());
        }
        candidates.first().map(|s| s.to_string())
    }

    /// Per-resource ratio `self_i / total_i` (resources absent from `total` drop out).
    pub fn div(&self, total: &Self) -> Self {
        let mut out = Self::zero();
        for (name, v) in self.iter() {
            let t = total.get(name);
            if t > 0.0 {
                out.set(name, v / t);
            }
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.values.values().all(|v| *v <= EPSILON)
    }

    /// True if every component is `<=` the matching limit (ε-aware).
    pub fn fits(&self, limits: &Self) -> bool {
        self.iter().all(|(name, v)| approx_le(v, limits.get(name)))
    }

    /// True if any component strictly exceeds `other`'s (ε-aware).
    pub fn any_gt(&self, other: &Self) -> bool {
        !self.fits(other)
    }

    /// `min_i usage_i / fair_share_i` over resources with non-zero fair share.
    ///
    /// Returns `f64::INFINITY` when the fair share is zero everywhere.
    pub fn satisfaction(usage: &Self, fair_share: &Self) -> f64 {
        fair_share
            .iter()
            .filter(|(_, f)| *f > EPSILON)
            .map(|(name, f)| usage.get(name) / f)
            .fold(f64::INFINITY, f64::min)
    }

    /// Scale this vector so its dominant share against `total` equals `ratio`.
    ///
    /// A zero vector stays zero.
    pub fn scale_to_dominant(&self, total: &Self, ratio: f64) -> Self {
        let current = self.dominant(total);
        if current <= 0.0 {
            return Self::zero();
        }
        self.scale(ratio / current)
    }
}

impl Add for &ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: Self) -> ResourceVector {
        ResourceVector::add(self, rhs)
    }
}

impl AddAssign<&ResourceVector> for ResourceVector {
    fn add_assign(&mut self, rhs: &ResourceVector) {
        *self = ResourceVector::add(self, rhs);
    }
}

impl Sub for &ResourceVector {
    type Output = ResourceVector;

    fn sub(self, rhs: Self) -> ResourceVector {
        self.sub_saturating(rhs)
    }
}

impl<'a> std::iter::Sum<&'a ResourceVector> for ResourceVector {
    fn sum<I: Iterator<Item = &'a ResourceVector>>(iter: I) -> Self {
        iter.fold(ResourceVector::zero(), |acc, v| acc.add(v))
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={v}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rv(pairs: &[(&str, f64)]) -> ResourceVector {
        ResourceVector::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn missing_keys_read_as_zero() {
        let v = rv(&[("cpu", 2.0)]);
        assert_eq!(v.get("memory"), 0.0);
        assert!(ResourceVector::zero().is_zero());
    }

    #[test]
    fn sub_saturates_at_zero() {
        let a = rv(&[("cpu", 1.0), ("memory", 10.0)]);
        let b = rv(&[("cpu", 3.0), ("memory", 4.0)]);
        let d = a.sub_saturating(&b);
        assert_eq!(d.get("cpu"), 0.0);
        assert_eq!(d.get("memory"), 6.0);
    }

    #[test]
    fn dominant_ignores_resources_missing_from_total() {
        let total = rv(&[("cpu", 10.0), ("memory", 100.0)]);
        let demand = rv(&[("cpu", 2.0), ("memory", 50.0), ("gpu", 1.0)]);
        assert!(approx_eq(demand.dominant(&total), 0.5));
        assert_eq!(demand.dominant_resource(&total).as_deref(), Some("memory"));
    }

    #[test]
    fn dominant_resource_tie_prefers_cpu() {
        let total = rv(&[("cpu", 10.0), ("memory", 100.0)]);
        let demand = rv(&[("cpu", 5.0), ("memory", 50.0)]);
        assert_eq!(demand.dominant_resource(&total).as_deref(), Some("cpu"));
    }

    #[test]
    fn fits_is_epsilon_aware() {
        let limits = rv(&[("cpu", 0.3)]);
        let usage = rv(&[("cpu", 0.1 + 0.2)]);
        assert!(usage.fits(&limits));
        assert!(!rv(&[("gpu", 1.0)]).fits(&limits));
    }

    #[test]
    fn satisfaction_takes_min_over_nonzero_fair_share() {
        let fair = rv(&[("cpu", 4.0), ("memory", 10.0)]);
        let usage = rv(&[("cpu", 2.0), ("memory", 10.0)]);
        assert!(approx_eq(ResourceVector::satisfaction(&usage, &fair), 0.5));
        assert_eq!(
            ResourceVector::satisfaction(&usage, &ResourceVector::zero()),
            f64::INFINITY
        );
    }

    #[test]
    fn scale_to_dominant_hits_target_ratio() {
        let total = rv(&[("cpu", 10.0), ("memory", 100.0)]);
        let demand = rv(&[("cpu", 4.0), ("memory", 20.0)]);
        let scaled = demand.scale_to_dominant(&total, 0.2);
        assert!(approx_eq(scaled.dominant(&total), 0.2));
        assert!(approx_eq(scaled.get("memory"), 10.0));
    }

    proptest! {
        #[test]
        fn add_then_sub_never_goes_negative(a in 0.0f64..1e6, b in 0.0f64..1e6, c in 0.0f64..1e6) {
            let x = rv(&[("cpu", a)]);
            let y = rv(&[("cpu", b)]);
            let z = rv(&[("cpu", c)]);
            let r = x.add(&y).sub_saturating(&z);
            prop_assert!(r.get("cpu") >= 0.0);
            prop_assert!(r.fits(&x.add(&y)));
        }

        #[test]
        fn min_fits_both_operands(a in 0.0f64..100.0, b in 0.0f64..100.0, m in 0.0f64..100.0) {
            let x = rv(&[("cpu", a), ("memory", m)]);
            let y = rv(&[("cpu", b)]);
            let lo = x.min(&y);
            prop_assert!(lo.fits(&x));
            prop_assert!(lo.fits(&y));
            prop_assert!(x.fits(&x.max(&y)));
        }
    }
}

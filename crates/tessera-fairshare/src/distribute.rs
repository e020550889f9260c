//! Share distribution among siblings.
//!
//! All quantities are dominant shares of the tree's total resources.
//! Each claimant has a demand `d`, a guarantee `g` and a weight `w`; the
//! weighted fill gives `min(d, g + λ·w)` with `λ` chosen so the shares sum
//! to what the parent has to give.

use tessera_core::EPSILON;

const SEARCH_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Claim {
    pub demand: f64,
    pub guarantee: f64,
    pub weight: f64,
}

impl Claim {
    pub fn new(demand: f64, guarantee: f64, weight: f64) -> Self {
        Self {
            demand: demand.max(0.0),
            guarantee: guarantee.max(0.0),
            weight: weight.max(0.0),
        }
    }

    fn guaranteed(&self) -> f64 {
        self.guarantee.min(self.demand)
    }

    fn at(&self, lambda: f64) -> f64 {
        (self.guarantee + lambda * self.weight).min(self.demand)
    }
}

/// Split `available` among `claims`.
///
/// The result never exceeds a claimant's demand and sums to
/// `min(available, Σ demand)`. When guarantees alone exceed `available`
/// they are scaled down proportionally.
pub fn weighted_fill(available: f64, claims: &[Claim]) -> Vec<f64> {
    let available = available.max(0.0);
    let total_demand: f64 = claims.iter().map(|c| c.demand).sum();
    if total_demand <= available + EPSILON {
        return claims.iter().map(|c| c.demand).collect();
    }

    let guaranteed: f64 = claims.iter().map(Claim::guaranteed).sum();
    if guaranteed >= available - EPSILON {
        let factor = if guaranteed > 0.0 { available / guaranteed } else { 0.0 };
        return claims.iter().map(|c| c.guaranteed() * factor).collect();
    }

    // Claims without weight stop at their guarantee.
    let mut hi = claims
        .iter()
        .filter(|c| c.weight > 0.0)
        .map(|c| (c.demand - c.guarantee).max(0.0) / c.weight)
        .fold(0.0, f64::max);
    let mut lo = 0.0;
    let sum_at = |lambda: f64| claims.iter().map(|c| c.at(lambda)).sum::<f64>();
    if sum_at(hi) <= available {
        return claims.iter().map(|c| c.at(hi)).collect();
    }
    for _ in 0..SEARCH_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if sum_at(mid) > available {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    claims.iter().map(|c| c.at(lo)).collect()
}

/// Fill demands in order until `available` runs out.
pub fn fifo_fill(available: f64, demands: &[f64]) -> Vec<f64> {
    let mut left = available.max(0.0);
    demands
        .iter()
        .map(|d| {
            let share = d.max(0.0).min(left);
            left = (left - share).max(0.0);
            share
        })
        .collect()
}

/// Scale `caps` by a common factor found by binary search so that the
/// weighted shares `min(cap_i, k·w_i)` sum to `available`.
///
/// Used for relaxed integral pools, whose weights are their accumulated
/// volume ratios.
pub fn capped_fill(available: f64, caps: &[f64], weights: &[f64]) -> Vec<f64> {
    let claims: Vec<Claim> = caps
        .iter()
        .zip(weights)
        .map(|(cap, w)| Claim::new(*cap, 0.0, *w))
        .collect();
    weighted_fill(available, &claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_core::approx_eq;

    #[test]
    fn everyone_satisfied_when_demand_fits() {
        let shares = weighted_fill(1.0, &[Claim::new(0.2, 0.0, 1.0), Claim::new(0.3, 0.0, 5.0)]);
        assert_eq!(shares, vec![0.2, 0.3]);
    }

    #[test]
    fn weights_split_the_rest() {
        let shares = weighted_fill(1.0, &[Claim::new(1.0, 0.0, 1.0), Claim::new(1.0, 0.0, 3.0)]);
        assert!(approx_eq(shares[0], 0.25));
        assert!(approx_eq(shares[1], 0.75));
    }

    #[test]
    fn guarantees_come_first() {
        let shares = weighted_fill(1.0, &[Claim::new(1.0, 0.6, 1.0), Claim::new(1.0, 0.0, 1.0)]);
        assert!(approx_eq(shares[0], 0.8));
        assert!(approx_eq(shares[1], 0.2));
    }

    #[test]
    fn small_demand_frees_share_for_others() {
        let shares = weighted_fill(1.0, &[Claim::new(0.1, 0.0, 1.0), Claim::new(1.0, 0.0, 1.0)]);
        assert!(approx_eq(shares[0], 0.1));
        assert!(approx_eq(shares[1], 0.9));
    }

    #[test]
    fn overcommitted_guarantees_scale_down() {
        let shares = weighted_fill(0.5, &[Claim::new(1.0, 0.6, 1.0), Claim::new(1.0, 0.4, 1.0)]);
        assert!(approx_eq(shares[0], 0.3));
        assert!(approx_eq(shares[1], 0.2));
    }

    #[test]
    fn fifo_serves_in_order() {
        assert_eq!(fifo_fill(1.0, &[0.6, 0.6, 0.2]), vec![0.6, 0.4, 0.0]);
    }

    proptest! {
        #[test]
        fn fill_never_exceeds_available_or_demand(
            available in 0.0f64..1.0,
            claims in prop::collection::vec((0.0f64..1.0, 0.0f64..0.5, 0.01f64..10.0), 1..12),
        ) {
            let claims: Vec<Claim> = claims.into_iter().map(|(d, g, w)| Claim::new(d, g, w)).collect();
            let shares = weighted_fill(available, &claims);
            let sum: f64 = shares.iter().sum();
            prop_assert!(sum <= available + 1e-6);
            let total_demand: f64 = claims.iter().map(|c| c.demand).sum();
            prop_assert!(sum >= available.min(total_demand) - 1e-6);
            for (share, claim) in shares.iter().zip(&claims) {
                prop_assert!(*share <= claim.demand + 1e-9);
                prop_assert!(*share >= -1e-12);
            }
        }
    }
}

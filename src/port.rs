//! UDP destination-port selection for traceroute probes.
//!
//! Pure functions of hop index, grounded on the same "strategy struct
//! with a `resolve`-style method" shape the teacher uses for its column
//! formatting tables (`report::format_row_data` dispatching on
//! `Column`), generalized here to port selection.

use std::collections::HashSet;

use rand::Rng;

/// How to pick the destination UDP port for a given hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortStrategy {
    /// Always the same port.
    Fixed(u16),
    /// `start + (hop - 1) * step`.
    Sequential { start: u16, step: u16 },
    /// Uniformly sampled from `[min, max]` (inclusive), excluding any
    /// port in `exclude`. `min > max` degenerates to the single value
    /// `min.clamp(1, 65535)` rather than looping forever or panicking
    /// (see SPEC_FULL.md §14).
    Random {
        min: u16,
        max: u16,
        exclude: HashSet<u16>,
    },
}

impl Default for PortStrategy {
    fn default() -> Self {
        PortStrategy::Fixed(33434)
    }
}

impl PortStrategy {
    /// Resolves the destination port for 1-based hop number `hop`.
    pub fn resolve(&self, hop: u32) -> u16 {
        match self {
            PortStrategy::Fixed(port) => *port,
            PortStrategy::Sequential { start, step } => {
                let delta = u32::from(*step).saturating_mul(hop.saturating_sub(1));
                (u32::from(*start).wrapping_add(delta)) as u16
            }
            PortStrategy::Random { min, max, exclude } => {
                Self::resolve_random(*min, *max, exclude)
            }
        }
    }

    fn resolve_random(min: u16, max: u16, exclude: &HashSet<u16>) -> u16 {
        let lo = min.max(1);
        let hi = max.max(lo).min(65535);
        if lo >= hi {
            return lo.min(65535);
        }
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(lo..=hi);
            if !exclude.contains(&candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_always_returns_same_port() {
        let s = PortStrategy::Fixed(33434);
        assert_eq!(s.resolve(1), 33434);
        assert_eq!(s.resolve(30), 33434);
    }

    #[test]
    fn sequential_matches_closed_form() {
        let s = PortStrategy::Sequential { start: 33434, step: 2 };
        for hop in 1..=20u32 {
            assert_eq!(s.resolve(hop), 33434 + (hop as u16 - 1) * 2);
        }
    }

    #[test]
    fn random_respects_inclusive_bounds_and_exclusions() {
        let mut exclude = HashSet::new();
        exclude.insert(1025);
        let s = PortStrategy::Random {
            min: 1024,
            max: 1026,
            exclude,
        };
        for _ in 0..200 {
            let p = s.resolve(1);
            assert!((1024..=1026).contains(&p));
            assert_ne!(p, 1025);
        }
    }

    #[test]
    fn random_min_greater_than_max_degenerates_to_single_value() {
        let s = PortStrategy::Random {
            min: 5000,
            max: 10,
            exclude: HashSet::new(),
        };
        for _ in 0..10 {
            assert_eq!(s.resolve(1), 5000);
        }
    }
}

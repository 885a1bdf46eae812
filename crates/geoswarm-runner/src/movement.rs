//! Where entities spawn and how they move each tick.

use geoswarm_types::Coordinate;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::MovementConfig;

/// Source of an entity's positions.
pub trait MovementSource: Send + Sync {
    /// The position the entity starts at.
    fn spawn_position(&mut self) -> Coordinate;

    /// The position after one tick, starting from `current`.
    fn next_position(&mut self, current: Coordinate) -> Coordinate;
}

/// Uniform random walk around a spawn square.
///
/// Spawn positions fall within `origin ± spawn_spread / 2` on each axis;
/// each tick moves by up to `± step / 2` on each axis. The sequence is a
/// pure function of the swarm seed and the entity index.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    rng: SmallRng,
    origin: Coordinate,
    spawn_spread: f64,
    step: f64,
}

impl RandomWalk {
    /// Create the walk for entity `index` of a swarm seeded with `seed`.
    pub fn new(config: &MovementConfig, seed: u64, index: u32) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(entity_seed(seed, index)),
            origin: config.origin(),
            spawn_spread: config.spawn_spread,
            step: config.step,
        }
    }

    fn jitter(&mut self, span: f64) -> f64 {
        (self.rng.random::<f64>() - 0.5) * span
    }
}

impl MovementSource for RandomWalk {
    fn spawn_position(&mut self) -> Coordinate {
        let spread = self.spawn_spread;
        let d_lat = self.jitter(spread);
        let d_lon = self.jitter(spread);
        self.origin.offset(d_lat, d_lon)
    }

    fn next_position(&mut self, current: Coordinate) -> Coordinate {
        let step = self.step;
        let d_lat = self.jitter(step);
        let d_lon = self.jitter(step);
        current.offset(d_lat, d_lon)
    }
}

/// An entity that never moves.
#[derive(Debug, Clone, Copy)]
pub struct Stationary(pub Coordinate);

impl MovementSource for Stationary {
    fn spawn_position(&mut self) -> Coordinate {
        self.0
    }

    fn next_position(&mut self, current: Coordinate) -> Coordinate {
        current
    }
}

/// Mix the swarm seed with the entity index (splitmix64 finaliser).
fn entity_seed(seed: u64, index: u32) -> u64 {
    let mut z = seed.wrapping_add(u64::from(index).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_are_reproducible_per_index() {
        let config = MovementConfig::default();
        let mut a = RandomWalk::new(&config, 42, 3);
        let mut b = RandomWalk::new(&config, 42, 3);
        let mut c = RandomWalk::new(&config, 42, 4);
        let start_a = a.spawn_position();
        assert_eq!(start_a, b.spawn_position());
        assert_ne!(start_a, c.spawn_position());
        assert_eq!(a.next_position(start_a), b.next_position(start_a));
    }

    #[test]
    fn spawn_and_steps_stay_within_bounds() {
        let config = MovementConfig::default();
        let origin = config.origin();
        let mut walk = RandomWalk::new(&config, 7, 0);
        for _ in 0..1_000 {
            let spawn = walk.spawn_position();
            assert!((spawn.lat - origin.lat).abs() <= config.spawn_spread / 2.0 + 1e-9);
            assert!((spawn.lon - origin.lon).abs() <= config.spawn_spread / 2.0 + 1e-9);
            let next = walk.next_position(spawn);
            assert!((next.lat - spawn.lat).abs() <= config.step / 2.0 + 1e-9);
            assert!((next.lon - spawn.lon).abs() <= config.step / 2.0 + 1e-9);
        }
    }

    #[test]
    fn zero_step_walk_is_still() {
        let config = MovementConfig {
            step: 0.0,
            ..MovementConfig::default()
        };
        let mut walk = RandomWalk::new(&config, 1, 1);
        let here = walk.spawn_position();
        assert_eq!(walk.next_position(here), here);
    }

    #[test]
    fn stationary_never_moves() {
        let here = Coordinate::new(1.0, 2.0);
        let mut still = Stationary(here);
        assert_eq!(still.spawn_position(), here);
        assert_eq!(still.next_position(here), here);
    }
}

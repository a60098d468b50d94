//! Victim selection for when every physical frame is in use.

use crate::config::ReplacementKind;
use alloc::boxed::Box;
use alloc::vec::Vec;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// What a policy may know about one physical frame.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct FrameUsage {
    pub used: bool,
    pub dirty: bool,
    /// The frame may be chosen. Frames that are free or that would hold the
    /// faulting page are never eligible.
    pub eligible: bool,
}

/// A page replacement algorithm.
pub trait ReplacementPolicy: Send {
    /// Returns the index of the frame to evict, or [`None`] if no frame is
    /// eligible. A policy may clear `used` bits as it goes; the caller copies
    /// them back to the page tables.
    fn select_victim(&mut self, frames: &mut [FrameUsage]) -> Option<usize>;
}

/// Evicts frames in turn, skipping the ineligible ones.
#[derive(Default)]
pub struct Fifo {
    cursor: usize,
}

/// Second chance: prefers frames neither used nor dirty, then unused dirty
/// ones, clearing use bits along the way.
#[derive(Default)]
pub struct Clock {
    cursor: usize,
}

/// Uniform choice among the eligible frames.
pub struct RandomChoice {
    rng: SmallRng,
}

impl RandomChoice {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomChoice {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ReplacementPolicy for Fifo {
    fn select_victim(&mut self, frames: &mut [FrameUsage]) -> Option<usize> {
        let total = frames.len();
        let victim = (self.cursor..self.cursor + total)
            .map(|i| i % total)
            .find(|&i| frames[i].eligible)?;
        self.cursor = (victim + 1) % total;
        Some(victim)
    }
}

impl ReplacementPolicy for Clock {
    fn select_victim(&mut self, frames: &mut [FrameUsage]) -> Option<usize> {
        let total = frames.len();
        for round in 1..=4 {
            for p in self.cursor..self.cursor + total {
                let frame = &mut frames[p % total];
                if !frame.eligible {
                    continue;
                }
                // Odd rounds look for clean frames, even rounds for dirty ones.
                let wanted_dirty = round % 2 == 0;
                if !frame.used && frame.dirty == wanted_dirty {
                    self.cursor = (p + 1) % total;
                    return Some(p % total);
                }
                if round == 2 {
                    frame.used = false;
                }
            }
        }
        self.cursor = (self.cursor + 1) % total;
        None
    }
}

impl ReplacementPolicy for RandomChoice {
    fn select_victim(&mut self, frames: &mut [FrameUsage]) -> Option<usize> {
        let eligible: Vec<usize> = (0..frames.len()).filter(|&i| frames[i].eligible).collect();
        if eligible.is_empty() {
            return None;
        }
        Some(eligible[self.rng.random_range(0..eligible.len())])
    }
}

/// The policy configured by `kind`.
pub fn build(kind: ReplacementKind, seed: u64) -> Box<dyn ReplacementPolicy> {
    match kind {
        ReplacementKind::Fifo => Box::new(Fifo::default()),
        ReplacementKind::Clock => Box::new(Clock::default()),
        ReplacementKind::Random => Box::new(RandomChoice::new(seed)),
    }
}

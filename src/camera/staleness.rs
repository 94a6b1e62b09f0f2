//! Frozen and invalid matrix tracking
//!
//! Two failure modes look different from the outside: a leftover camera keeps
//! producing a perfectly plausible matrix that never changes, while a wrong
//! camera produces garbage that changes every tick. Each has its own counter
//! and fires exactly once when its threshold is crossed.

use super::ViewMatrix;
use crate::config::CameraConfig;

/// Recovery the engine should perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Matrix unchanged for `ticks` consecutive ticks
    Frozen {
        /// Identical ticks observed
        ticks: u32,
    },
    /// Matrix invalid for `ticks` consecutive ticks
    Invalid {
        /// Invalid ticks observed
        ticks: u32,
    },
}

/// Per-camera counters for the two failure modes
#[derive(Debug, Clone)]
pub struct StalenessTracker {
    previous: Option<ViewMatrix>,
    identical: u32,
    invalid: u32,
    epsilon: f32,
    frozen_threshold: u32,
    invalid_threshold: u32,
}

impl StalenessTracker {
    /// Tracker using the thresholds in `config`
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            previous: None,
            identical: 0,
            invalid: 0,
            epsilon: config.frozen_epsilon,
            frozen_threshold: config.frozen_threshold.max(1),
            invalid_threshold: config.invalid_threshold.max(1),
        }
    }

    /// Record a matrix that passed validation
    pub fn observe_valid(&mut self, matrix: &ViewMatrix) -> Option<Recovery> {
        self.invalid = 0;

        let unchanged = self
            .previous
            .as_ref()
            .is_some_and(|previous| previous.same_pose(matrix, self.epsilon));

        self.identical = if unchanged {
            self.identical.saturating_add(1)
        } else {
            1
        };
        self.previous = Some(*matrix);

        (self.identical == self.frozen_threshold).then_some(Recovery::Frozen {
            ticks: self.identical,
        })
    }

    /// Record a tick whose matrix was rejected or unreadable
    pub fn observe_invalid(&mut self) -> Option<Recovery> {
        self.identical = 0;
        self.previous = None;
        self.invalid = self.invalid.saturating_add(1);

        (self.invalid == self.invalid_threshold).then_some(Recovery::Invalid {
            ticks: self.invalid,
        })
    }

    /// Consecutive identical ticks so far
    pub fn identical_ticks(&self) -> u32 {
        self.identical
    }

    /// Consecutive invalid ticks so far
    pub fn invalid_ticks(&self) -> u32 {
        self.invalid
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.previous = None;
        self.identical = 0;
        self.invalid = 0;
    }
}

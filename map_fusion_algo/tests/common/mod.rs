//! Synthetic corridor world shared by the fusion scenarios

#![allow(dead_code)]

use std::collections::BTreeSet;

use map_fusion_algo::prelude::*;
use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const RANGE: f64 = 3.0;
pub const POSITION_VARIANCE: f64 = 1e-4;
pub const HEADING_VARIANCE: f64 = 1e-5;
pub const FEATURE_VARIANCE: f64 = 1e-4;

/// Landmarks on both sides of a corridor along +x, at least 0.8 m apart
pub fn landmarks() -> Vec<Vector2<f64>> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..28)
        .map(|i| {
            let side = if i % 2 == 0 { 1.0 } else { -1.0 };
            Vector2::new(
                -1.0 + i as f64 * 0.55 + rng.gen_range(-0.15..0.15),
                side * rng.gen_range(1.0..2.5),
            )
        })
        .collect()
}

/// Ground-truth poses; the first one is the global origin
pub fn trajectory(n: usize) -> Vec<Pose2D> {
    (0..n)
        .map(|k| {
            let k = k as f64;
            Pose2D::new(k * 0.8, 0.1 * k.sin(), 0.05 * (0.7 * k).sin())
        })
        .collect()
}

pub struct Scenario {
    pub truth: Vec<Pose2D>,
    pub submaps: Vec<LocalSubmap>,
    /// Landmark indices seen by each submap
    pub visible: Vec<Vec<usize>>,
}

impl Scenario {
    /// `count` submaps, submap `k` running from pose `k` to pose `k + 1`
    pub fn corridor(count: usize, noise: f64) -> Self {
        let world = landmarks();
        let truth = trajectory(count + 1);
        let mut rng = StdRng::seed_from_u64(42);
        let mut jitter = |scale: f64| {
            if noise > 0.0 {
                rng.gen_range(-noise..noise) * scale
            } else {
                0.0
            }
        };

        let mut submaps = Vec::with_capacity(count);
        let mut visible = Vec::with_capacity(count);
        for k in 0..count {
            let start = truth[k];
            let seen: Vec<usize> = (0..world.len())
                .filter(|&i| (world[i] - start.translation()).norm() <= RANGE)
                .collect();
            let features = seen
                .iter()
                .map(|&i| {
                    start.inverse_transform_point(&world[i]) + Vector2::new(jitter(1.0), jitter(1.0))
                })
                .collect();
            let motion = start.between(&truth[k + 1]);
            let end_pose = Pose2D::new(
                motion.x + jitter(1.0),
                motion.y + jitter(1.0),
                motion.theta + jitter(0.3),
            );
            submaps.push(LocalSubmap::with_diagonal_covariance(
                end_pose,
                features,
                POSITION_VARIANCE,
                HEADING_VARIANCE,
                FEATURE_VARIANCE,
            ));
            visible.push(seen);
        }

        Self {
            truth,
            submaps,
            visible,
        }
    }

    /// Distinct landmarks seen by the first `count` submaps
    pub fn landmarks_seen(&self, count: usize) -> usize {
        self.visible[..count]
            .iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Engine without scheduled refusion
pub fn quiet_config() -> FusionConfig {
    let mut config = FusionConfig::default();
    config.refusion.period = 0;
    config.refusion.first_at = 0;
    config
}

pub fn assert_pose_near(estimate: &Pose2D, truth: &Pose2D, tolerance: f64) {
    let translation = (estimate.translation() - truth.translation()).norm();
    let heading = (estimate.theta - truth.theta).abs();
    assert!(
        translation <= tolerance && heading <= tolerance,
        "estimate {estimate:?} too far from {truth:?}"
    );
}

mod common;

use std::thread;

use approx::assert_relative_eq;
use common::*;
use map_fusion_algo::prelude::*;
use nalgebra::Vector2;

#[test]
fn second_submap_adds_one_feature_and_links_pose() {
    map_fusion_algo::init_logger();
    let mut engine = GlobalMapFusionEngine::with_config(quiet_config());

    let seed = LocalSubmap::with_diagonal_covariance(
        Pose2D::origin(),
        vec![
            Vector2::new(2.0, 1.0),
            Vector2::new(-1.0, 2.5),
            Vector2::new(0.5, -2.0),
        ],
        POSITION_VARIANCE,
        HEADING_VARIANCE,
        FEATURE_VARIANCE,
    );
    engine.consume_local_submap(seed).unwrap();
    let entries = engine.global_state().len();
    assert_eq!(engine.global_state().feature_count(), 3);

    let second = LocalSubmap::with_diagonal_covariance(
        Pose2D::new(1.0, 0.0, 0.0),
        vec![Vector2::new(2.0, 1.0), Vector2::new(3.5, -1.5)],
        POSITION_VARIANCE,
        HEADING_VARIANCE,
        FEATURE_VARIANCE,
    );
    let report = engine.consume_local_submap(second).unwrap();

    assert_eq!(report.matched, 1);
    assert_eq!(report.new_features, 1);
    assert_eq!(engine.global_state().feature_count(), 4);
    // one new feature plus the new end pose
    assert_eq!(engine.global_state().len(), entries + 2);
    let pose = engine.latest_pose().unwrap();
    assert_relative_eq!(pose.to_vector(), Pose2D::new(1.0, 0.0, 0.0).to_vector(), epsilon = 1e-6);
}

#[test]
fn corridor_tracks_ground_truth() {
    let scenario = Scenario::corridor(10, 0.005);
    let mut engine = GlobalMapFusionEngine::with_config(quiet_config());

    for (k, submap) in scenario.submaps.iter().enumerate() {
        let report = engine.consume_local_submap(submap.clone()).unwrap();
        if k > 0 {
            assert_eq!(report.strategy, Some(AssociationStrategy::NearestNeighbor));
            assert!(report.matched >= 2, "submap {k} matched {}", report.matched);
        }
    }

    assert_eq!(engine.phase(), FusionPhase::Fusing);
    assert_eq!(
        engine.global_state().feature_count(),
        scenario.landmarks_seen(scenario.submaps.len())
    );
    let poses = engine.poses().unwrap();
    for (k, pose) in poses.iter().enumerate() {
        assert_pose_near(pose, &scenario.truth[k + 1], 0.1);
    }
    assert!(engine.estimation_error() < engine.config().estimation_error_cutoff);
}

#[test]
fn information_matrix_stays_sparse() {
    let scenario = Scenario::corridor(12, 0.0);
    let mut engine = GlobalMapFusionEngine::with_config(quiet_config());
    for submap in &scenario.submaps {
        engine.consume_local_submap(submap.clone()).unwrap();
    }

    let stats = engine.sparsity_stats();
    let n = engine.global_state().len();
    // features at opposite ends of the corridor are never linked
    assert!(stats.blocks < n * (n + 1) / 2, "{stats}");
    assert_eq!(engine.information_matrix().dims(), engine.global_state().dims().as_slice());
}

#[test]
fn scheduled_refusion_keeps_estimate() {
    let scenario = Scenario::corridor(8, 0.005);
    let mut config = FusionConfig::default();
    config.refusion.first_at = 6;
    config.refusion.period = 0;
    let mut engine = GlobalMapFusionEngine::with_config(config);

    let mut refused = Vec::new();
    for submap in &scenario.submaps {
        let report = engine.consume_local_submap(submap.clone()).unwrap();
        refused.push(report.refused);
    }
    assert_eq!(refused.iter().filter(|r| **r).count(), 1);
    assert!(refused[5]);

    let features = engine.global_state().feature_count();
    let before = engine.poses().unwrap();
    let summary = engine.refuse_all().unwrap();
    assert_eq!(summary.fused, scenario.submaps.len());
    assert!(summary.dropped.is_empty());
    assert!(summary.max_pose_shift < 0.05, "shift {}", summary.max_pose_shift);
    assert_eq!(engine.global_state().feature_count(), features);

    for (a, b) in before.iter().zip(engine.poses().unwrap().iter()) {
        assert_pose_near(a, b, 0.05);
    }
    let sequences: Vec<usize> = engine.records().iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (0..scenario.submaps.len()).collect::<Vec<_>>());
}

#[test]
fn association_failure_is_recoverable() {
    let scenario = Scenario::corridor(5, 0.0);
    let mut engine = GlobalMapFusionEngine::with_config(quiet_config());
    for submap in &scenario.submaps[..3] {
        engine.consume_local_submap(submap.clone()).unwrap();
    }
    let entries = engine.global_state().len();
    let error = engine.estimation_error();

    let mut lost = scenario.submaps[3].clone();
    for feature in &mut lost.features {
        *feature += Vector2::new(100.0, 100.0);
    }
    let err = engine.consume_local_submap(lost).unwrap_err();
    assert!(err.is_recoverable(), "{err}");
    assert_eq!(engine.global_state().len(), entries);
    assert_relative_eq!(engine.estimation_error(), error);

    for submap in &scenario.submaps[3..] {
        engine.consume_local_submap(submap.clone()).unwrap();
    }
    assert_eq!(engine.submap_count(), 5);
    let poses = engine.poses().unwrap();
    assert_pose_near(&poses[4], &scenario.truth[5], 0.05);
}

#[test]
fn grid_voting_relocalizes_every_submap() {
    let scenario = Scenario::corridor(6, 0.005);
    let mut config = quiet_config();
    config.estimation_error_cutoff = 1e-6;
    let mut engine = GlobalMapFusionEngine::with_config(config);

    for (k, submap) in scenario.submaps.iter().enumerate() {
        let report = engine.consume_local_submap(submap.clone()).unwrap();
        if k > 0 {
            assert_eq!(report.strategy, Some(AssociationStrategy::GridVoting));
        }
    }

    assert_eq!(
        engine.global_state().feature_count(),
        scenario.landmarks_seen(scenario.submaps.len())
    );
    let poses = engine.poses().unwrap();
    for (k, pose) in poses.iter().enumerate() {
        assert_pose_near(pose, &scenario.truth[k + 1], 0.1);
    }
}

#[test]
fn worker_fuses_queued_submaps() {
    let scenario = Scenario::corridor(6, 0.005);
    let queue = SubmapQueue::bounded(2);
    let producer = queue.producer();
    let worker = queue.spawn_worker(GlobalMapFusionEngine::with_config(quiet_config()));

    let submaps = scenario.submaps.clone();
    let front_end = thread::spawn(move || {
        for submap in submaps {
            producer.enqueue(submap).unwrap();
        }
    });
    // statuses are read as they arrive; the status channel is as bounded as the queue
    let statuses: Vec<FusionStatus> = worker
        .statuses()
        .iter()
        .take(scenario.submaps.len())
        .collect();
    front_end.join().unwrap();

    let (engine, unread) = worker.join().unwrap();
    assert!(unread.is_empty());
    assert_eq!(statuses.len(), scenario.submaps.len());
    for (k, status) in statuses.iter().enumerate() {
        match status {
            FusionStatus::Completed(report) => assert_eq!(report.sequence, k),
            FusionStatus::Failed { reason, .. } => panic!("submap {k} failed: {reason}"),
        }
    }
    assert_pose_near(
        &engine.latest_pose().unwrap(),
        &scenario.truth[scenario.submaps.len()],
        0.1,
    );
}

#[test]
fn config_file_drives_engine() {
    let path = std::env::temp_dir().join("map_fusion_algo_scenario.yaml");
    std::fs::write(
        &path,
        "refusion:\n  period: 0\n  first_at: 0\nsubmap_capacity: 2\n",
    )
    .unwrap();
    let config = FusionConfig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(config.submap_capacity, 2);

    let scenario = Scenario::corridor(1, 0.0);
    let mut engine = GlobalMapFusionEngine::with_config(config);
    let err = engine.consume_local_submap(scenario.submaps[0].clone()).unwrap_err();
    assert!(matches!(err, FusionError::InvalidSubmap(_)));
}

//! End-to-end scenarios through the public pipeline surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use approx::assert_relative_eq;
use nalgebra::{Vector2, Vector3};

use rust_dense_mapping::io::{CameraIntrinsics, SyntheticSensor, SyntheticSensorConfig};
use rust_dense_mapping::{
    ColorImage, PipelineConfig, PipelineError, PipelineManager, PresentationEvent, RawFrame,
    TrackingState,
};

/// One point at (1, 1, 1) sampled from the centre of a red image.
fn unit_point_frame(timestamp: f64) -> RawFrame {
    RawFrame::new(
        timestamp,
        vec![Vector3::new(1.0, 1.0, 1.0)],
        vec![Vector2::new(0.5, 0.5)],
        ColorImage::filled(4, 4, [255, 0, 0]),
    )
}

fn coarse_config(translation_threshold: f64) -> PipelineConfig {
    PipelineConfig {
        voxel_size: 0.5,
        keyframe_translation_threshold: translation_threshold,
        keyframe_rotation_threshold_radians: translation_threshold,
        ..PipelineConfig::default()
    }
}

fn run_static_sequence(translation_threshold: f64, frames: usize) -> PipelineManager {
    let mut pipeline = PipelineManager::new(coarse_config(translation_threshold)).unwrap();
    pipeline.start().unwrap();
    for i in 0..frames {
        pipeline.submit_frame(unit_point_frame(i as f64)).unwrap();
    }
    pipeline.finish().unwrap();
    pipeline
}

#[test]
fn static_camera_with_zero_threshold_fuses_every_frame() {
    let pipeline = run_static_sequence(0.0, 3);

    let surfels = pipeline.surfels();
    assert_eq!(surfels.len(), 1);
    let s = surfels[0];
    assert_eq!(s.update_count, 3);
    assert_relative_eq!(s.position, Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-9);
    assert_relative_eq!(s.color, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-6);
    assert_relative_eq!(s.confidence, 0.3, epsilon = 1e-9);
    assert_eq!(s.last_update_time, 2.0);

    // Cell (2, 2, 2) at voxel size 0.5.
    let map = pipeline.voxel_map();
    assert!(map.surfel_at(&Vector3::new(1.2, 1.4, 1.01)).is_some());
    assert!(map.surfel_at(&Vector3::new(0.99, 1.0, 1.0)).is_none());

    let stats = pipeline.stats();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.keyframes_emitted, 3);
    assert_eq!(stats.keyframes_fused, 3);
    assert_eq!(stats.keyframes_rejected, 0);
}

#[test]
fn static_camera_with_positive_threshold_fuses_first_frame_only() {
    let pipeline = run_static_sequence(0.1, 3);

    let surfels = pipeline.surfels();
    assert_eq!(surfels.len(), 1);
    assert_eq!(surfels[0].update_count, 1);
    assert_relative_eq!(surfels[0].confidence, 0.1, epsilon = 1e-9);

    let stats = pipeline.stats();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.frames_tracked, 3);
    assert_eq!(stats.keyframes_emitted, 1);
}

#[test]
fn restart_keeps_map_and_tracking_state() {
    let mut pipeline = run_static_sequence(0.0, 2);
    assert!(!pipeline.is_running());
    assert!(matches!(
        pipeline.submit_frame(unit_point_frame(9.0)),
        Err(PipelineError::NotRunning)
    ));

    pipeline.start().unwrap();
    pipeline.submit_frame(unit_point_frame(2.0)).unwrap();
    pipeline.finish().unwrap();

    let surfels = pipeline.surfels();
    assert_eq!(surfels.len(), 1);
    assert_eq!(surfels[0].update_count, 3);
    assert_eq!(pipeline.stats().keyframes_fused, 3);
}

#[test]
fn stop_is_idempotent_and_restartable() {
    let mut pipeline = PipelineManager::new(coarse_config(0.0)).unwrap();
    pipeline.start().unwrap();
    pipeline.stop();
    pipeline.stop();

    pipeline.start().unwrap();
    let sender = pipeline.frame_sender().unwrap();
    sender.send(unit_point_frame(0.0)).unwrap();
    drop(sender);
    pipeline.finish().unwrap();

    assert_eq!(pipeline.surfels()[0].update_count, 1);
}

#[test]
fn stop_under_load_leaves_only_whole_keyframes() {
    let mut pipeline = PipelineManager::new(coarse_config(0.0)).unwrap();
    pipeline.start().unwrap();
    for i in 0..200 {
        pipeline.submit_frame(unit_point_frame(i as f64)).unwrap();
    }
    pipeline.stop();
    assert!(!pipeline.is_running());

    let stats = pipeline.stats();
    assert!(stats.keyframes_fused <= stats.keyframes_emitted);
    assert!(stats.keyframes_emitted <= stats.frames_received);
    assert_eq!(stats.keyframes_rejected, 0);

    let surfels = pipeline.surfels();
    assert!(surfels.len() <= 1);
    match surfels.first() {
        Some(s) => {
            assert_eq!(s.update_count as u64, stats.keyframes_fused);
            assert!((0.0..=1.0).contains(&s.confidence));
            assert!((s.normal.norm() - 1.0).abs() < 1e-4);
            assert_relative_eq!(s.position, Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-9);
        }
        None => assert_eq!(stats.keyframes_fused, 0),
    }
}

#[test]
fn live_frames_and_map_updates_reach_presentation() {
    let mut pipeline = PipelineManager::new(coarse_config(0.0)).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    pipeline.set_presentation_target(tx);

    pipeline.start().unwrap();
    for i in 0..4 {
        pipeline.submit_frame(unit_point_frame(i as f64)).unwrap();
    }
    pipeline.finish().unwrap();
    pipeline.clear_presentation_target();

    let events: Vec<PresentationEvent> = rx.iter().collect();
    let live: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PresentationEvent::Live(frame) => Some(frame),
            PresentationEvent::MapUpdated => None,
        })
        .collect();
    let updates = events
        .iter()
        .filter(|e| matches!(e, PresentationEvent::MapUpdated))
        .count();

    assert_eq!(live.len(), 4);
    assert_eq!(updates, 4);
    for (i, frame) in live.iter().enumerate() {
        assert_eq!(frame.timestamp, i as f64);
        assert_eq!(frame.state, TrackingState::Ok);
        assert_eq!(frame.points.len(), 1);
        assert_relative_eq!(frame.pose_matrix(), nalgebra::Matrix4::identity(), epsilon = 1e-12);
    }
}

#[test]
fn synthetic_room_builds_a_consistent_map_under_concurrent_reads() {
    let sensor_config = SyntheticSensorConfig {
        intrinsics: CameraIntrinsics::from_fov(64, 48, 70f64.to_radians()),
        num_frames: 12,
        ..SyntheticSensorConfig::default()
    };
    let config = PipelineConfig {
        voxel_size: 0.1,
        optimization_interval: 2,
        optimization_window_size: 3,
        ..PipelineConfig::default()
    };

    let mut pipeline = PipelineManager::new(config).unwrap();
    let map = pipeline.voxel_map();
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let map = Arc::clone(&map);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut snapshots = 0;
            loop {
                let finished = done.load(Ordering::Relaxed);
                for s in map.surfels() {
                    assert!(s.update_count >= 1);
                    assert!((0.0..=1.0).contains(&s.confidence));
                    assert!((s.normal.norm() - 1.0).abs() < 1e-4);
                }
                snapshots += 1;
                if finished {
                    break snapshots;
                }
                thread::yield_now();
            }
        })
    };

    pipeline.start().unwrap();
    for frame in SyntheticSensor::new(sensor_config) {
        pipeline.submit_frame(frame).unwrap();
    }
    pipeline.finish().unwrap();
    done.store(true, Ordering::Relaxed);
    assert!(reader.join().unwrap() > 0);

    let stats = pipeline.stats();
    assert_eq!(stats.frames_received, 12);
    assert!(stats.keyframes_fused >= 1);
    assert_eq!(stats.keyframes_rejected, 0);
    assert!(!map.is_empty());

    // Every surfel sits on (or, after refinement, near) a wall of the room.
    let h = Vector3::new(2.0, 1.5, 2.5);
    for s in map.surfels() {
        let near_wall = (0..3).any(|i| (s.position[i].abs() - h[i]).abs() < 0.3);
        assert!(near_wall, "surfel at {:?} is off the walls", s.position);
    }
}

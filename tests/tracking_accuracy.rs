//! Pose accuracy of the feature odometry on the synthetic room.

use rust_dense_mapping::TrackingState;
use rust_dense_mapping::io::{SyntheticSensor, SyntheticSensorConfig};
use rust_dense_mapping::tracking::{Frontend, KeyframeGate, TrackingConfig};

#[test]
fn feature_tracking_follows_synthetic_trajectory() {
    let sensor = SyntheticSensor::new(SyntheticSensorConfig::default());
    let frame_rate = sensor.config().frame_rate;
    let mut frontend = Frontend::new(
        TrackingConfig::default(),
        KeyframeGate::new(0.1, 10f64.to_radians()),
    );

    let origin = sensor.pose_at(0).inverse();
    for i in 0..30 {
        let truth = sensor.pose_at(i);
        let output = frontend.process_new_frame(sensor.render(&truth, i as f64 / frame_rate));
        if i == 0 {
            continue;
        }

        let result = &output.result;
        assert_eq!(result.state, TrackingState::Ok, "frame {}", i);
        assert!(result.metrics.used_features, "frame {} fell back to the prior", i);

        let expected = origin * truth;
        let t_err = result.pose.translation_distance(&expected);
        let r_err = result.pose.rotation_angle_to(&expected);
        assert!(t_err < 0.1, "frame {}: translation error {:.4} m", i, t_err);
        assert!(r_err < 0.05, "frame {}: rotation error {:.4} rad", i, r_err);
    }
}

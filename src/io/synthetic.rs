//! Synthetic RGB-D sensor: a pinhole camera moving inside a textured box room.
//!
//! Each wall carries a checkerboard whose cells get a hashed color, so the
//! images have plenty of corners and every cell is distinguishable. Depth is
//! exact (ray/box intersection), which makes the sequence useful for demos
//! and for end-to-end tests where the true trajectory is known.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::frame::{ColorImage, RawFrame};
use crate::geometry::SE3;

/// Pinhole intrinsics in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: usize,
    pub height: usize,
}

impl CameraIntrinsics {
    /// Square pixels, principal point at the image centre.
    pub fn from_fov(width: usize, height: usize, horizontal_fov_radians: f64) -> Self {
        let f = width as f64 * 0.5 / (horizontal_fov_radians * 0.5).tan();
        Self {
            fx: f,
            fy: f,
            cx: width as f64 * 0.5,
            cy: height as f64 * 0.5,
            width,
            height,
        }
    }

    /// Camera-frame ray through the centre of pixel (u, v), with z = 1.
    pub fn ray(&self, u: usize, v: usize) -> Vector3<f64> {
        Vector3::new(
            (u as f64 + 0.5 - self.cx) / self.fx,
            (v as f64 + 0.5 - self.cy) / self.fy,
            1.0,
        )
    }
}

/// Synthetic sequence parameters.
#[derive(Debug, Clone)]
pub struct SyntheticSensorConfig {
    pub intrinsics: CameraIntrinsics,
    /// Half side lengths of the room, centred at the world origin.
    pub room_half_extents: Vector3<f64>,
    /// Checker cell edge length on the walls (m).
    pub checker_size: f64,
    /// Emit a point every `pixel_stride` pixels in both directions.
    pub pixel_stride: usize,
    pub start_pose: SE3,
    /// Per-frame motion, applied in the camera frame (T_k = T_{k-1} * motion).
    pub motion: SE3,
    pub frame_rate: f64,
    pub num_frames: usize,
}

impl Default for SyntheticSensorConfig {
    fn default() -> Self {
        Self {
            intrinsics: CameraIntrinsics::from_fov(160, 120, 70f64.to_radians()),
            room_half_extents: Vector3::new(2.0, 1.5, 2.5),
            checker_size: 0.25,
            pixel_stride: 2,
            start_pose: SE3::identity(),
            motion: SE3::new(
                UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0),
                Vector3::new(0.01, 0.0, 0.005),
            ),
            frame_rate: 30.0,
            num_frames: 60,
        }
    }
}

/// Frame source over a [`SyntheticSensorConfig`].
#[derive(Debug, Clone)]
pub struct SyntheticSensor {
    config: SyntheticSensorConfig,
    pose: SE3,
    frame_index: usize,
}

impl SyntheticSensor {
    pub fn new(config: SyntheticSensorConfig) -> Self {
        Self {
            pose: config.start_pose,
            config,
            frame_index: 0,
        }
    }

    pub fn config(&self) -> &SyntheticSensorConfig {
        &self.config
    }

    /// True camera-to-world pose of frame `index`.
    pub fn pose_at(&self, index: usize) -> SE3 {
        (0..index).fold(self.config.start_pose, |pose, _| pose * self.config.motion)
    }

    /// Render the view from `pose` (T_wc).
    pub fn render(&self, pose: &SE3, timestamp: f64) -> RawFrame {
        let k = &self.config.intrinsics;
        let stride = self.config.pixel_stride.max(1);
        let origin = pose.translation;

        let mut pixels = Vec::with_capacity(k.width * k.height * 3);
        let mut points = Vec::new();
        let mut tex_coords = Vec::new();

        for v in 0..k.height {
            for u in 0..k.width {
                let ray_cam = k.ray(u, v);
                let ray_world = pose.rotate_vector(&ray_cam);

                match self.hit_wall(&origin, &ray_world) {
                    Some((t, hit)) => {
                        pixels.extend_from_slice(&self.wall_color(&hit));
                        if u % stride == 0 && v % stride == 0 {
                            points.push((ray_cam * t).cast::<f32>());
                            tex_coords.push(Vector2::new(
                                ((u as f64 + 0.5) / k.width as f64) as f32,
                                ((v as f64 + 0.5) / k.height as f64) as f32,
                            ));
                        }
                    }
                    None => pixels.extend_from_slice(&[0, 0, 0]),
                }
            }
        }

        RawFrame::new(
            timestamp,
            points,
            tex_coords,
            ColorImage::new(k.width, k.height, 3, pixels),
        )
    }

    /// Distance along `dir` to the room wall and the wall hit point, for an
    /// origin inside the room.
    fn hit_wall(&self, origin: &Vector3<f64>, dir: &Vector3<f64>) -> Option<(f64, WallHit)> {
        let h = &self.config.room_half_extents;
        let mut best: Option<(f64, usize)> = None;
        for axis in 0..3 {
            if dir[axis].abs() < 1e-12 {
                continue;
            }
            let wall = h[axis].copysign(dir[axis]);
            let t = (wall - origin[axis]) / dir[axis];
            if t > 0.0 && best.map_or(true, |(bt, _)| t < bt) {
                best = Some((t, axis));
            }
        }
        let (t, axis) = best?;
        let position = origin + dir * t;
        Some((
            t,
            WallHit {
                axis,
                positive: dir[axis] > 0.0,
                position,
            },
        ))
    }

    fn wall_color(&self, hit: &WallHit) -> [u8; 3] {
        let (a, b) = match hit.axis {
            0 => (hit.position.y, hit.position.z),
            1 => (hit.position.x, hit.position.z),
            _ => (hit.position.x, hit.position.y),
        };
        let ca = (a / self.config.checker_size).floor() as i64;
        let cb = (b / self.config.checker_size).floor() as i64;

        let wall_id = (hit.axis as u64) * 2 + hit.positive as u64;
        let h = mix(wall_id ^ mix(ca as u64) ^ mix(cb as u64).rotate_left(17));

        // Alternate dark and bright cells so neighbours always contrast.
        let base: u8 = if (ca + cb).rem_euclid(2) == 0 { 40 } else { 150 };
        [
            base + (h & 0x3f) as u8,
            base + ((h >> 8) & 0x3f) as u8,
            base + ((h >> 16) & 0x3f) as u8,
        ]
    }
}

impl Iterator for SyntheticSensor {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        if self.frame_index >= self.config.num_frames {
            return None;
        }
        let timestamp = self.frame_index as f64 / self.config.frame_rate;
        let frame = self.render(&self.pose, timestamp);

        self.pose = self.pose * self.config.motion;
        self.frame_index += 1;
        Some(frame)
    }
}

#[derive(Debug, Clone, Copy)]
struct WallHit {
    axis: usize,
    positive: bool,
    position: Vector3<f64>,
}

/// SplitMix64 finalizer.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

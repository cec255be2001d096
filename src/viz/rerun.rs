//! Rerun-based presentation of the dense-mapping pipeline.
//!
//! Entity hierarchy:
//!     status               - Tracking state and frame counter
//!     camera/
//!         image            - Live color image
//!     world/
//!         camera           - Live camera transform
//!         live_points      - Live cloud in world coordinates
//!         trajectory       - Camera path
//!         surfels          - Fused map, colored, sized by surfel radius
//!     plots/
//!         surfel_count     - Temporal plot

use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};
use nalgebra::Vector3;
use rerun::{RecordingStream, RecordingStreamResult, external::glam};

use crate::frame::NEUTRAL_GRAY;
use crate::geometry::SE3;
use crate::map::VoxelMap;
use crate::system::messages::{LiveFrame, PresentationEvent};

/// Consumes [`PresentationEvent`]s and logs them to a rerun viewer.
pub struct RerunPresenter {
    rec: RecordingStream,
    map: Arc<VoxelMap>,
    trajectory: Vec<[f32; 3]>,
    frames: u64,
}

impl RerunPresenter {
    /// Spawn a viewer process and connect to it.
    pub fn spawn(app_name: &str, map: Arc<VoxelMap>) -> RecordingStreamResult<Self> {
        let rec = rerun::RecordingStreamBuilder::new(app_name).spawn()?;
        rec.log_static("world", &rerun::ViewCoordinates::RDF()).ok();
        Ok(Self {
            rec,
            map,
            trajectory: Vec::new(),
            frames: 0,
        })
    }

    /// Log events until every sender is dropped.
    ///
    /// Consecutive map notifications are coalesced into one snapshot.
    pub fn run(mut self, events: Receiver<PresentationEvent>) {
        let mut map_dirty = false;
        loop {
            match events.try_recv() {
                Ok(PresentationEvent::Live(frame)) => self.log_live(&frame),
                Ok(PresentationEvent::MapUpdated) => map_dirty = true,
                Err(TryRecvError::Empty) => {
                    if map_dirty {
                        self.log_map();
                        map_dirty = false;
                    }
                    match events.recv() {
                        Ok(PresentationEvent::Live(frame)) => self.log_live(&frame),
                        Ok(PresentationEvent::MapUpdated) => map_dirty = true,
                        Err(_) => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        if map_dirty {
            self.log_map();
        }
    }

    pub fn log_live(&mut self, frame: &LiveFrame) {
        self.frames += 1;
        self.rec.set_duration_secs("time", frame.timestamp);

        let status = format!("**{}** | frame {}", frame.state, self.frames);
        self.rec
            .log(
                "status",
                &rerun::TextDocument::new(status).with_media_type(rerun::MediaType::markdown()),
            )
            .ok();

        self.log_camera_pose(&frame.pose);

        if frame.image.bytes_per_pixel == 3 && !frame.image.is_empty() {
            self.rec
                .log(
                    "camera/image",
                    &rerun::Image::from_rgb24(
                        frame.image.pixels.clone(),
                        [frame.image.width as u32, frame.image.height as u32],
                    ),
                )
                .ok();
        }

        let gray = Vector3::repeat(NEUTRAL_GRAY);
        let mut pts = Vec::with_capacity(frame.points.len());
        let mut colors = Vec::with_capacity(frame.points.len());
        for (i, p) in frame.points.iter().enumerate() {
            let w = frame.pose.transform_point(&p.cast::<f64>());
            if !w.iter().all(|v| v.is_finite()) {
                continue;
            }
            let c = frame
                .tex_coords
                .get(i)
                .and_then(|uv| frame.image.sample(uv))
                .unwrap_or(gray);
            pts.push([w.x as f32, w.y as f32, w.z as f32]);
            colors.push(to_rgb8(&c));
        }
        if !pts.is_empty() {
            self.rec
                .log(
                    "world/live_points",
                    &rerun::Points3D::new(pts)
                        .with_colors(colors)
                        .with_radii([0.005f32]),
                )
                .ok();
        }

        let t = &frame.pose.translation;
        self.trajectory.push([t.x as f32, t.y as f32, t.z as f32]);
        if self.trajectory.len() >= 2 {
            self.rec
                .log(
                    "world/trajectory",
                    &rerun::LineStrips3D::new([self.trajectory.clone()])
                        .with_colors([[128u8, 128, 128]])
                        .with_radii([0.005f32]),
                )
                .ok();
        }
    }

    fn log_camera_pose(&self, pose: &SE3) {
        let translation = glam::Vec3::new(
            pose.translation.x as f32,
            pose.translation.y as f32,
            pose.translation.z as f32,
        );
        let rotation = glam::Quat::from_xyzw(
            pose.rotation.coords.x as f32,
            pose.rotation.coords.y as f32,
            pose.rotation.coords.z as f32,
            pose.rotation.w as f32,
        );
        self.rec
            .log(
                "world/camera",
                &rerun::Transform3D::from_translation_rotation(translation, rotation),
            )
            .ok();
    }

    /// Log a snapshot of every surfel.
    pub fn log_map(&self) {
        let surfels = self.map.surfels();
        self.rec
            .log(
                "plots/surfel_count",
                &rerun::Scalars::new([surfels.len() as f64]),
            )
            .ok();
        if surfels.is_empty() {
            return;
        }

        let pts: Vec<[f32; 3]> = surfels
            .iter()
            .map(|s| [s.position.x as f32, s.position.y as f32, s.position.z as f32])
            .collect();
        let colors: Vec<[u8; 3]> = surfels.iter().map(|s| to_rgb8(&s.color)).collect();
        let radii: Vec<f32> = surfels.iter().map(|s| s.radius as f32).collect();

        self.rec
            .log(
                "world/surfels",
                &rerun::Points3D::new(pts)
                    .with_colors(colors)
                    .with_radii(radii),
            )
            .ok();
    }
}

fn to_rgb8(c: &Vector3<f32>) -> [u8; 3] {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    [q(c.x), q(c.y), q(c.z)]
}

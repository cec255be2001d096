//! Pipeline manager: owns the voxel map and runs the two stage threads.
//!
//! ```text
//!  submit_frame ──► [frame channel] ──► frontend ──► [keyframe channel] ──► backend
//!                                          │                                  │
//!                                          └── Live ──► presentation ◄── MapUpdated
//! ```
//!
//! Both channels are unbounded. Stage state is handed back through the
//! thread join handles, so the pipeline can be stopped and started again
//! without losing tracking state or keyframe numbering.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::frame::RawFrame;
use crate::map::{Keyframe, Surfel, VoxelMap};
use crate::mapping::Backend;
use crate::optimizer::{LmRefiner, MapRefiner};
use crate::tracking::{Frontend, Odometry};

use super::messages::PresentationEvent;
use super::shared_state::{PipelineStats, SharedState};

/// Handles of a running pipeline.
struct RunningStages {
    frame_sender: Sender<RawFrame>,
    frontend: JoinHandle<Frontend>,
    backend: JoinHandle<Backend>,
}

/// Top-level entry point of the dense-mapping pipeline.
pub struct PipelineManager {
    config: PipelineConfig,
    map: Arc<VoxelMap>,
    shared: Arc<SharedState>,

    /// Stage state while stopped. Moved into the threads by `start`.
    frontend: Option<Frontend>,
    backend: Option<Backend>,

    /// Refiner installed in every backend this manager builds.
    refiner: Option<Arc<dyn MapRefiner>>,

    running: Option<RunningStages>,
}

impl PipelineManager {
    /// Validate `config` and create an empty map.
    ///
    /// Uses the feature odometry and the Levenberg-Marquardt refiner.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let map = Arc::new(VoxelMap::with_params(config.voxel_size, config.surfel)?);
        let refiner: Arc<dyn MapRefiner> = Arc::new(LmRefiner::new(config.refiner.clone()));

        let mut manager = Self {
            config,
            map,
            shared: SharedState::new(),
            frontend: None,
            backend: None,
            refiner: Some(refiner),
            running: None,
        };
        manager.frontend = Some(manager.default_frontend());
        manager.backend = Some(manager.default_backend());
        Ok(manager)
    }

    /// Replace the odometry strategy. Call before `start`.
    pub fn with_odometry(mut self, odometry: Box<dyn Odometry>) -> Self {
        self.frontend = Some(Frontend::with_odometry(
            self.config.tracking.clone(),
            self.config.keyframe_gate(),
            odometry,
        ));
        self
    }

    /// Replace (or remove, with `None`) the refinement capability. Call
    /// before `start`.
    ///
    /// The choice also applies to any backend rebuilt after a stage thread
    /// is lost.
    pub fn with_refiner(mut self, refiner: Option<Box<dyn MapRefiner>>) -> Self {
        self.refiner = refiner.map(Arc::from);
        match self.backend.as_mut() {
            Some(backend) => backend.set_refiner(self.refiner.clone()),
            None => self.backend = Some(self.default_backend()),
        }
        self
    }

    fn default_frontend(&self) -> Frontend {
        Frontend::new(self.config.tracking.clone(), self.config.keyframe_gate())
    }

    fn default_backend(&self) -> Backend {
        Backend::new(
            Arc::clone(&self.map),
            self.config.backend_config(),
            self.refiner.clone(),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn the frontend and backend threads.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let frontend = match self.frontend.take() {
            Some(f) => f,
            None => self.default_frontend(),
        };
        let backend = match self.backend.take() {
            Some(b) => b,
            None => self.default_backend(),
        };

        self.shared.clear_shutdown();
        let (frame_sender, frame_receiver) = unbounded::<RawFrame>();
        let (keyframe_sender, keyframe_receiver) = unbounded::<Keyframe>();

        let shared = Arc::clone(&self.shared);
        let backend_handle = match thread::Builder::new()
            .name("backend".into())
            .spawn(move || backend.run(keyframe_receiver, shared))
        {
            Ok(handle) => handle,
            Err(source) => {
                self.frontend = Some(frontend);
                return Err(PipelineError::Spawn {
                    stage: "backend",
                    source,
                });
            }
        };

        let shared = Arc::clone(&self.shared);
        let frontend_handle = match thread::Builder::new()
            .name("frontend".into())
            .spawn(move || frontend.run(frame_receiver, keyframe_sender, shared))
        {
            Ok(handle) => handle,
            Err(source) => {
                // The keyframe sender was dropped with the closure, so the
                // backend exits on its own.
                self.backend = backend_handle.join().ok();
                return Err(PipelineError::Spawn {
                    stage: "frontend",
                    source,
                });
            }
        };

        self.running = Some(RunningStages {
            frame_sender,
            frontend: frontend_handle,
            backend: backend_handle,
        });
        info!("[Pipeline] started (voxel_size={})", self.config.voxel_size);
        Ok(())
    }

    /// Stop both stages without draining their queues.
    ///
    /// Queued frames and keyframes are dropped; a fusion already in
    /// progress completes. Does nothing when not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.shared.request_shutdown();
        self.join(running);
        info!("[Pipeline] stopped");
    }

    /// Close the input and wait until every queued frame and keyframe has
    /// been processed.
    ///
    /// Senders obtained from [`frame_sender`](Self::frame_sender) must be
    /// dropped first, or this waits for them.
    pub fn finish(&mut self) -> Result<()> {
        let running = self.running.take().ok_or(PipelineError::NotRunning)?;
        self.join(running);
        info!("[Pipeline] finished, {} surfels", self.map.len());
        Ok(())
    }

    /// Close the frame input and wait for both stage threads.
    fn join(&mut self, running: RunningStages) {
        let RunningStages {
            frame_sender,
            frontend,
            backend,
        } = running;
        drop(frame_sender);

        self.frontend = match frontend.join() {
            Ok(frontend) => Some(frontend),
            Err(_) => {
                error!("[Pipeline] frontend thread panicked, tracking state reset");
                None
            }
        };
        self.backend = match backend.join() {
            Ok(backend) => Some(backend),
            Err(_) => {
                error!("[Pipeline] backend thread panicked, refinement history reset");
                None
            }
        };
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Push one frame to the frontend. Never blocks.
    pub fn submit_frame(&self, frame: RawFrame) -> Result<()> {
        let running = self.running.as_ref().ok_or(PipelineError::NotRunning)?;
        running
            .frame_sender
            .send(frame)
            .map_err(|_| PipelineError::NotRunning)
    }

    /// Sender for a sensor source running on its own thread.
    pub fn frame_sender(&self) -> Result<Sender<RawFrame>> {
        self.running
            .as_ref()
            .map(|running| running.frame_sender.clone())
            .ok_or(PipelineError::NotRunning)
    }

    /// Route live frames and map notifications to `target`. May be called
    /// at any time, including while running.
    pub fn set_presentation_target(&self, target: Sender<PresentationEvent>) {
        self.shared.set_presentation_target(Some(target));
    }

    pub fn clear_presentation_target(&self) {
        self.shared.set_presentation_target(None);
    }

    pub fn voxel_map(&self) -> Arc<VoxelMap> {
        Arc::clone(&self.map)
    }

    /// Snapshot of the fused surfels.
    pub fn surfels(&self) -> Vec<Surfel> {
        self.map.surfels()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.stop();
    }
}

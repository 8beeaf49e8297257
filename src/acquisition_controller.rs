use std::time::{Duration, Instant};

use crate::{
    board_controller::TriggerBoard,
    camera_controller::{Camera, ImageHandler},
    common::{str_time, AcquisitionMode, Clock, ShutdownToken},
    error::{AcquisitionError, CameraError},
    laser_controller::{describe_faults, Laser},
};

/// Bookkeeping for one acquisition run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunState {
    pub(crate) armed: bool,
    /// Complete images handed to the image handler.
    pub(crate) image_count: u32,
    /// Completions seen on the done line.
    pub(crate) trigger_count: u32,
    pub(crate) last_trigger: Instant,
    /// Set while laser fault polls are failing, so the failure is logged once.
    pub(crate) laser_unreachable: bool,
}

/**
 * Arms the board, waits for it to fire and hands each resulting image to the
 * image handler, until shutdown is requested. Owns the board for the whole
 * run; the camera, laser and image handler are optional collaborators.
 */
pub(crate) struct AcquisitionLoop<'a, B, C> {
    board: &'a mut B,
    clock: C,
    mode: AcquisitionMode,
    interval: Duration,
    shutdown: ShutdownToken,
    camera: Option<&'a mut dyn Camera>,
    images: Option<&'a mut dyn ImageHandler>,
    laser: Option<&'a mut dyn Laser>,
}

///////////////////
// Implementations
///////////////////
impl RunState {
    fn new(start: Instant) -> Self {
        Self {
            armed: false,
            image_count: 0,
            trigger_count: 0,
            last_trigger: start,
            laser_unreachable: false,
        }
    }
}

impl<'a, B: TriggerBoard, C: Clock> AcquisitionLoop<'a, B, C> {
    pub(crate) fn new(
        board: &'a mut B,
        clock: C,
        mode: AcquisitionMode,
        interval: Duration,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            board,
            clock,
            mode,
            interval,
            shutdown,
            camera: None,
            images: None,
            laser: None,
        }
    }

    pub(crate) fn with_camera(
        mut self,
        camera: &'a mut dyn Camera,
        images: &'a mut dyn ImageHandler,
    ) -> Self {
        self.camera = Some(camera);
        self.images = Some(images);
        self
    }

    pub(crate) fn with_laser(mut self, laser: &'a mut dyn Laser) -> Self {
        self.laser = Some(laser);
        self
    }

    /**
     * Runs until shutdown. Only a camera that refuses to start is an error;
     * a bad frame is logged and the loop carries on. The board is always left
     * disarmed.
     */
    pub(crate) fn run(mut self) -> Result<RunState, AcquisitionError> {
        let mut state = RunState::new(self.clock.now());

        if let Some(camera) = self.camera.as_mut() {
            if !camera.is_initialized() {
                self.board.disarm();
                return Err(CameraError::NotInitialized.into());
            }
            if let Err(e) = camera.begin_acquisition() {
                self.board.disarm();
                return Err(e.into());
            }
        }

        log::info!("Starting {} acquisition.", self.mode);
        self._run_until_shutdown(&mut state);

        if state.armed {
            log::debug!("Shutdown while armed.");
        }
        self.board.disarm();
        state.armed = false;
        debug_assert!(!self.board.is_armed());
        if let Some(camera) = self.camera.as_mut() {
            if let Err(e) = camera.end_acquisition() {
                log::error!("Failed to end camera acquisition: {e}");
            }
        }
        log::info!(
            "Acquisition ended after {} triggers and {} images.",
            state.trigger_count,
            state.image_count
        );
        Ok(state)
    }

    fn _run_until_shutdown(&mut self, state: &mut RunState) {
        while !self.shutdown.is_requested() {
            if self.mode == AcquisitionMode::ContinuousWave {
                self.clock.idle();
                continue;
            }

            self.board.arm();
            state.armed = true;

            if self.mode.is_timed() {
                if !self._wait_for_interval(state) {
                    break;
                }
                state.last_trigger = self.clock.now();
                self.board.trigger();
            }

            if !self._wait_for_done() {
                break;
            }
            let done_at = self.clock.now();
            let stamp = str_time();
            self.board.disarm();
            state.armed = false;
            state.trigger_count += 1;

            self._process(state, done_at, &stamp);
        }
    }

    /// Spins until `interval` has passed since the last trigger. False means
    /// shutdown, either requested elsewhere or forced by a laser fault.
    fn _wait_for_interval(&mut self, state: &mut RunState) -> bool {
        loop {
            if self.shutdown.is_requested() {
                return false;
            }
            if let Some(laser) = self.laser.as_mut() {
                let polled = laser.fault();
                if polled.is_ok() && state.laser_unreachable {
                    log::info!("Laser fault polling recovered.");
                    state.laser_unreachable = false;
                }
                match polled {
                    Ok(0) => {}
                    Ok(fault) => {
                        log::error!("Laser fault {:#08x}. Stopping acquisition.", fault);
                        for description in describe_faults(fault) {
                            log::error!("    {}", description);
                        }
                        self.shutdown.request();
                        return false;
                    }
                    Err(e) if !state.laser_unreachable => {
                        log::warn!("Failed to poll laser fault: {e}");
                        state.laser_unreachable = true;
                    }
                    Err(_) => {}
                }
            }
            if self.clock.now().duration_since(state.last_trigger) >= self.interval {
                return true;
            }
            self.clock.idle();
        }
    }

    /// Spins on the done line. False means shutdown came first.
    fn _wait_for_done(&self) -> bool {
        loop {
            if self.board.is_done() {
                return true;
            }
            if self.shutdown.is_requested() {
                return false;
            }
            self.clock.idle();
        }
    }

    fn _process(&mut self, state: &mut RunState, done_at: Instant, stamp: &str) {
        let Some(camera) = self.camera.as_mut() else {
            log::info!("Triggered ({}) at {}.", state.trigger_count, stamp);
            return;
        };

        match camera.acquire_image(done_at) {
            Ok(image) => {
                if let Some(images) = self.images.as_mut() {
                    images.handle(image, state.image_count, stamp);
                }
                state.image_count += 1;
            }
            Err(CameraError::Incomplete(reason)) => {
                log::warn!("Image incomplete: {reason}");
            }
            Err(e) => log::error!("Failed to acquire image: {e}"),
        }
    }
}

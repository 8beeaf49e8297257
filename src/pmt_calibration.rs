use std::time::Duration;

use crate::{
    board_controller::TriggerBoard,
    common::{CalibrationResult, CalibrationStrategy, Clock, ShutdownToken, TriggerSource},
    error::{BoardError, CalibrationError},
};

/// Threshold held fixed while the gain is searched.
pub(crate) const THRESHOLD_MIDPOINT: u8 = 0x7F;
/// Pulled off the converged threshold to keep clear of the noise edge.
pub(crate) const THRESHOLD_OFFSET: u8 = 3;

const SEARCH_START: u8 = 0x80;
const SEARCH_STEP: u8 = 0x40;

/**
 * One observation of the discriminator at a given operating point. Returns
 * true when no trigger fired during the observation.
 */
pub(crate) trait Probe {
    fn pass(&mut self, gain: u8, threshold: u8) -> Result<bool, BoardError>;
}

/**
 * Probe that watches the real board for a spurious trigger during `window`.
 */
pub(crate) struct BoardProbe<'a, B, C> {
    board: &'a mut B,
    clock: C,
    window: Duration,
    shutdown: ShutdownToken,
}

impl<'a, B: TriggerBoard, C: Clock> BoardProbe<'a, B, C> {
    pub(crate) fn new(
        board: &'a mut B,
        clock: C,
        window: Duration,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            board,
            clock,
            window,
            shutdown,
        }
    }

    fn _observe(&mut self, gain: u8, threshold: u8) -> Result<bool, BoardError> {
        self.board.set_pmt_gain(gain)?;
        self.board.set_pmt_threshold(threshold)?;
        self.board.reset();
        self.board.arm();

        let start = self.clock.now();
        loop {
            if self.board.is_done() {
                return Ok(false);
            }
            if self.shutdown.is_requested() {
                return Ok(false);
            }
            if self.clock.now().duration_since(start) >= self.window {
                return Ok(true);
            }
            self.clock.idle();
        }
    }
}

impl<B: TriggerBoard, C: Clock> Probe for BoardProbe<'_, B, C> {
    fn pass(&mut self, gain: u8, threshold: u8) -> Result<bool, BoardError> {
        let result = self._observe(gain, threshold);
        self.board.disarm();
        result
    }
}

/**
 * Finds the most sensitive (gain, threshold) pair that stays quiet for a
 * whole observation window.
 */
pub(crate) fn calibrate<P: Probe>(
    probe: &mut P,
    strategy: CalibrationStrategy,
    shutdown: &ShutdownToken,
) -> Result<CalibrationResult, CalibrationError> {
    match strategy {
        CalibrationStrategy::BinarySearch => _binary_search(probe, shutdown),
        CalibrationStrategy::LinearSweep => _linear_sweep(probe, shutdown),
    }
}

/**
 * Switches the board to the PMT trigger and calibrates it against the live
 * discriminator. The trigger source is left on the PMT.
 */
pub(crate) fn calibrate_board<B: TriggerBoard, C: Clock>(
    board: &mut B,
    clock: C,
    window: Duration,
    strategy: CalibrationStrategy,
    shutdown: &ShutdownToken,
) -> Result<CalibrationResult, CalibrationError> {
    board.set_trigger_source(TriggerSource::SensorDriven);
    let mut probe = BoardProbe::new(board, clock, window, shutdown.clone());
    calibrate(&mut probe, strategy, shutdown)
}

/// Gain first with the threshold at its midpoint, then the threshold.
fn _binary_search<P: Probe>(
    probe: &mut P,
    shutdown: &ShutdownToken,
) -> Result<CalibrationResult, CalibrationError> {
    log::info!(
        "Searching gain with threshold fixed at {:#04x}.",
        THRESHOLD_MIDPOINT
    );
    let gain = _bisect(|gain| probe.pass(gain, THRESHOLD_MIDPOINT), shutdown)?
        .ok_or(CalibrationError::NoPassingRegion)?;
    log::info!("Gain converged at {:#04x}.", gain);

    let threshold = _bisect(|threshold| probe.pass(gain, threshold), shutdown)?
        .ok_or(CalibrationError::NoPassingRegion)?;
    log::info!("Threshold converged at {:#04x}.", threshold);

    Ok(CalibrationResult {
        gain,
        threshold: threshold.saturating_sub(THRESHOLD_OFFSET),
    })
}

/**
 * Binary search for the lowest passing value, assuming everything above a
 * boundary passes and everything below fails. A pass steps toward the more
 * sensitive end, a failure steps back, and the step halves each time.
 * The probes form a complete search tree over 1..=255, so both neighbours of
 * the boundary are always visited.
 */
fn _bisect<F>(mut passes: F, shutdown: &ShutdownToken) -> Result<Option<u8>, CalibrationError>
where
    F: FnMut(u8) -> Result<bool, BoardError>,
{
    let mut value = SEARCH_START;
    let mut step = SEARCH_STEP;
    let mut lowest_passing = None;
    loop {
        let passed = passes(value)?;
        if shutdown.is_requested() {
            return Err(CalibrationError::Cancelled);
        }
        log::debug!(
            "Probe {:#04x}: {}",
            value,
            if passed { "pass" } else { "fail" }
        );
        if passed {
            lowest_passing = Some(value);
        }
        if step == 0 {
            return Ok(lowest_passing);
        }
        value = if passed { value - step } else { value + step };
        step /= 2;
    }
}

/// Every pair from 0xFF down to 0x00, gain outermost; first quiet pair wins.
fn _linear_sweep<P: Probe>(
    probe: &mut P,
    shutdown: &ShutdownToken,
) -> Result<CalibrationResult, CalibrationError> {
    for gain in (0..=u8::MAX).rev() {
        log::debug!("Sweeping thresholds at gain {:#04x}.", gain);
        for threshold in (0..=u8::MAX).rev() {
            let passed = probe.pass(gain, threshold)?;
            if shutdown.is_requested() {
                return Err(CalibrationError::Cancelled);
            }
            if passed {
                return Ok(CalibrationResult { gain, threshold });
            }
        }
    }
    Err(CalibrationError::NoPassingRegion)
}

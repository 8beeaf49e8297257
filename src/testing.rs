//! Test doubles for the board, camera, laser and clock.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{
    board_controller::{GpioLines, RegisterBus, TriggerBoard},
    camera_controller::{Camera, Image, ImageHandler},
    common::{Clock, ShutdownToken, TriggerSource},
    error::{BoardError, CameraError, LaserError},
    laser_controller::{FaultCode, Laser},
    pmt_calibration::Probe,
};

/// Virtual time: `idle` advances by a fixed step, `settle` by its duration.
#[derive(Clone)]
pub(crate) struct FakeClock {
    start: Instant,
    elapsed: Rc<Cell<Duration>>,
    settles: Rc<Cell<usize>>,
    step: Duration,
}

impl FakeClock {
    pub(crate) fn new(step: Duration) -> Self {
        Self {
            start: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
            settles: Rc::new(Cell::new(0)),
            step,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    pub(crate) fn settles(&self) -> usize {
        self.settles.get()
    }

    pub(crate) fn advance(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed.get()
    }

    fn idle(&self) {
        self.advance(self.step);
    }

    fn settle(&self, duration: Duration) {
        self.settles.set(self.settles.get() + 1);
        self.advance(duration);
    }
}

/// GPIO lines that remember every write.
#[derive(Clone, Default)]
pub(crate) struct RecordingLines {
    writes: Rc<RefCell<Vec<(u8, bool)>>>,
    levels: Rc<RefCell<HashMap<u8, bool>>>,
}

impl RecordingLines {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn writes(&self) -> Vec<(u8, bool)> {
        self.writes.borrow().clone()
    }

    pub(crate) fn level(&self, pin: u8) -> Option<bool> {
        self.levels.borrow().get(&pin).copied()
    }

    pub(crate) fn clear(&self) {
        self.writes.borrow_mut().clear();
    }
}

impl GpioLines for RecordingLines {
    fn write(&mut self, pin: u8, high: bool) {
        self.writes.borrow_mut().push((pin, high));
        self.levels.borrow_mut().insert(pin, high);
    }

    fn read(&self, pin: u8) -> bool {
        self.level(pin).unwrap_or(false)
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingBus {
    writes: Rc<RefCell<Vec<(u8, u8)>>>,
    failing: Rc<Cell<bool>>,
}

impl RecordingBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn writes(&self) -> Vec<(u8, u8)> {
        self.writes.borrow().clone()
    }

    pub(crate) fn fail_writes(&self) {
        self.failing.set(true);
    }
}

impl RegisterBus for RecordingBus {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BoardError> {
        if self.failing.get() {
            return Err(BoardError::Bus(String::from("no acknowledge")));
        }
        self.writes.borrow_mut().push((register, value));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BoardEvent {
    Arm,
    Disarm,
    Trigger(Duration),
    Source(TriggerSource),
    Delay(u8),
    Exposure(u8),
    Pulse(u8),
    Gain(u8),
    Threshold(u8),
    Acquire,
}

pub(crate) type EventLog = Rc<RefCell<Vec<BoardEvent>>>;

/**
 * Scripted board. The done line goes high `done_after` polls after the last
 * arm (and, if `needs_trigger`, only once a program trigger was sent).
 */
pub(crate) struct StubBoard {
    log: EventLog,
    clock: Option<FakeClock>,
    armed: bool,
    triggered: bool,
    source: TriggerSource,
    done_after: Option<usize>,
    needs_trigger: bool,
    polls: Cell<usize>,
    shutdown_after: Option<(usize, ShutdownToken)>,
}

impl StubBoard {
    pub(crate) fn new() -> Self {
        Self {
            log: EventLog::default(),
            clock: None,
            armed: false,
            triggered: false,
            source: TriggerSource::SensorDriven,
            done_after: None,
            needs_trigger: false,
            polls: Cell::new(0),
            shutdown_after: None,
        }
    }

    pub(crate) fn done_after(mut self, polls: usize) -> Self {
        self.done_after = Some(polls);
        self
    }

    /// Program driven board that completes `polls` polls after each trigger.
    pub(crate) fn done_after_trigger(mut self, polls: usize) -> Self {
        self.done_after = Some(polls);
        self.needs_trigger = true;
        self.source = TriggerSource::ProgramDriven;
        self
    }

    /// Requests shutdown on the given poll since the last arm.
    pub(crate) fn shutdown_after(mut self, polls: usize, shutdown: ShutdownToken) -> Self {
        self.shutdown_after = Some((polls, shutdown));
        self
    }

    /// Timestamps program triggers against `clock`.
    pub(crate) fn with_clock(mut self, clock: FakeClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub(crate) fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub(crate) fn events(&self) -> Vec<BoardEvent> {
        self.log.borrow().clone()
    }

    fn _record(&self, event: BoardEvent) {
        self.log.borrow_mut().push(event);
    }
}

impl TriggerBoard for StubBoard {
    fn arm(&mut self) {
        self.armed = true;
        self.triggered = false;
        self.polls.set(0);
        self._record(BoardEvent::Arm);
    }

    fn disarm(&mut self) {
        self.armed = false;
        self._record(BoardEvent::Disarm);
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn is_done(&self) -> bool {
        let polls = self.polls.get() + 1;
        self.polls.set(polls);
        if let Some((after, shutdown)) = &self.shutdown_after {
            if polls >= *after {
                shutdown.request();
            }
        }
        if !self.armed || (self.needs_trigger && !self.triggered) {
            return false;
        }
        matches!(self.done_after, Some(after) if polls >= after)
    }

    fn set_trigger_source(&mut self, source: TriggerSource) {
        self.source = source;
        self._record(BoardEvent::Source(source));
    }

    fn trigger(&mut self) {
        if self.source == TriggerSource::SensorDriven {
            return;
        }
        self.triggered = true;
        self.polls.set(0);
        let at = self
            .clock
            .as_ref()
            .map(|clock| clock.elapsed())
            .unwrap_or_default();
        self._record(BoardEvent::Trigger(at));
    }

    fn set_delay(&mut self, delay: u8) -> Result<(), BoardError> {
        self._record(BoardEvent::Delay(delay));
        Ok(())
    }

    fn set_exposure(&mut self, exposure: u8) -> Result<(), BoardError> {
        self._record(BoardEvent::Exposure(exposure));
        Ok(())
    }

    fn set_pulse(&mut self, pulse: u8) -> Result<(), BoardError> {
        self._record(BoardEvent::Pulse(pulse));
        Ok(())
    }

    fn set_pmt_gain(&mut self, gain: u8) -> Result<(), BoardError> {
        self._record(BoardEvent::Gain(gain));
        Ok(())
    }

    fn set_pmt_threshold(&mut self, threshold: u8) -> Result<(), BoardError> {
        self._record(BoardEvent::Threshold(threshold));
        Ok(())
    }
}

/// Calibration probe answering from a closure instead of the board.
pub(crate) struct OracleProbe<F> {
    oracle: F,
    history: Vec<(u8, u8)>,
}

impl<F: FnMut(u8, u8) -> bool> OracleProbe<F> {
    pub(crate) fn new(oracle: F) -> Self {
        Self {
            oracle,
            history: Vec::new(),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.history.len()
    }

    pub(crate) fn history(&self) -> &[(u8, u8)] {
        &self.history
    }
}

impl<F: FnMut(u8, u8) -> bool> Probe for OracleProbe<F> {
    fn pass(&mut self, gain: u8, threshold: u8) -> Result<bool, BoardError> {
        self.history.push((gain, threshold));
        Ok((self.oracle)(gain, threshold))
    }
}

/// Camera that returns tiny fake frames and logs each acquisition.
pub(crate) struct StubCamera {
    log: EventLog,
    pub(crate) acquiring: bool,
    pub(crate) fail_begin: bool,
    pub(crate) acquisitions: usize,
    pub(crate) last_since: Option<Instant>,
    pub(crate) released: bool,
    incomplete: Vec<usize>,
    shutdown_after: Option<(usize, ShutdownToken)>,
}

impl StubCamera {
    pub(crate) fn new(log: EventLog) -> Self {
        Self {
            log,
            acquiring: false,
            fail_begin: false,
            acquisitions: 0,
            last_since: None,
            released: false,
            incomplete: Vec::new(),
            shutdown_after: None,
        }
    }

    /// The listed acquisitions (1-based) come back incomplete.
    pub(crate) fn incomplete_on(mut self, acquisitions: Vec<usize>) -> Self {
        self.incomplete = acquisitions;
        self
    }

    pub(crate) fn shutdown_after(mut self, acquisitions: usize, shutdown: ShutdownToken) -> Self {
        self.shutdown_after = Some((acquisitions, shutdown));
        self
    }
}

impl Camera for StubCamera {
    fn is_initialized(&self) -> bool {
        true
    }

    fn begin_acquisition(&mut self) -> Result<(), CameraError> {
        if self.fail_begin {
            return Err(CameraError::Start(String::from("stream refused")));
        }
        self.acquiring = true;
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<(), CameraError> {
        self.acquiring = false;
        Ok(())
    }

    fn acquire_image(&mut self, since: Instant) -> Result<Image, CameraError> {
        self.acquisitions += 1;
        self.last_since = Some(since);
        self.log.borrow_mut().push(BoardEvent::Acquire);
        if let Some((after, shutdown)) = &self.shutdown_after {
            if self.acquisitions >= *after {
                shutdown.request();
            }
        }
        if self.incomplete.contains(&self.acquisitions) {
            return Err(CameraError::Incomplete(String::from("dropped packets")));
        }
        Ok(Image {
            data: vec![0xFF, 0xD8, 0xFF, 0xD9],
            width: 1,
            height: 1,
        })
    }

    fn release(&mut self) {
        self.acquiring = false;
        self.released = true;
    }
}

/// Image handler that keeps the index of every image it is given.
#[derive(Default)]
pub(crate) struct CollectedImages {
    pub(crate) indices: Vec<u32>,
    pub(crate) finished: bool,
}

impl ImageHandler for CollectedImages {
    fn handle(&mut self, _image: Image, index: u32, _stamp: &str) {
        self.indices.push(index);
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

/// Laser whose fault polls are scripted; once the script runs out it is healthy.
#[derive(Default)]
pub(crate) struct StubLaser {
    faults: VecDeque<Result<FaultCode, LaserError>>,
    pub(crate) polls: usize,
    pub(crate) emitting: bool,
    shutdown_after: Option<(usize, ShutdownToken)>,
}

impl StubLaser {
    pub(crate) fn new(faults: Vec<Result<FaultCode, LaserError>>) -> Self {
        Self {
            faults: faults.into(),
            ..Self::default()
        }
    }

    /// Requests shutdown on the given fault poll.
    pub(crate) fn shutdown_after(mut self, polls: usize, shutdown: ShutdownToken) -> Self {
        self.shutdown_after = Some((polls, shutdown));
        self
    }
}

impl Laser for StubLaser {
    fn fault(&mut self) -> Result<FaultCode, LaserError> {
        self.polls += 1;
        if let Some((after, shutdown)) = &self.shutdown_after {
            if self.polls >= *after {
                shutdown.request();
            }
        }
        self.faults.pop_front().unwrap_or(Ok(0))
    }

    fn set_emission(&mut self, on: bool) -> Result<(), LaserError> {
        self.emitting = on;
        Ok(())
    }
}

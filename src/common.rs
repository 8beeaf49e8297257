use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/**
 * Process-wide cancellation flag. Written by the signal handler thread (and by
 * the acquisition loop on a laser fault), read by every spin-wait.
 */
#[derive(Debug, Clone, Default)]
pub(crate) struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

/**
 * Source of time for every busy-wait in the controller. The real clock spins
 * against `Instant`; tests swap in a virtual clock so no test ever sleeps.
 */
pub(crate) trait Clock {
    fn now(&self) -> Instant;
    /// One iteration of a spin-wait.
    fn idle(&self);
    /// Wait for a hardware line or register to stabilise.
    fn settle(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn idle(&self) {
        (**self).idle()
    }

    fn settle(&self, duration: Duration) {
        (**self).settle(duration)
    }
}

/// What a spin-wait does between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollStrategy {
    Yield,
    Spin,
    Sleep(Duration),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemClock {
    poll: PollStrategy,
}

impl SystemClock {
    pub(crate) fn new(poll: PollStrategy) -> Self {
        Self { poll }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(PollStrategy::Yield)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn idle(&self) {
        match self.poll {
            PollStrategy::Yield => thread::yield_now(),
            PollStrategy::Spin => std::hint::spin_loop(),
            PollStrategy::Sleep(duration) => thread::sleep(duration),
        }
    }

    fn settle(&self, duration: Duration) {
        // The scheduler can't resolve sub-millisecond sleeps, so spin for those.
        if duration >= Duration::from_millis(1) {
            thread::sleep(duration);
            return;
        }
        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerSource {
    /// The PMT discriminator output fires the board.
    SensorDriven,
    /// The board fires when the controller pulses the trigger line.
    ProgramDriven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquisitionMode {
    Triggered,
    Interval,
    TriggerTest,
    Alignment,
    ContinuousWave,
}

impl AcquisitionMode {
    pub(crate) fn from_str(mode: &str) -> Option<Self> {
        match mode.trim().to_lowercase().as_str() {
            "trigger" => Some(Self::Triggered),
            "interval" => Some(Self::Interval),
            "test" => Some(Self::TriggerTest),
            "align" => Some(Self::Alignment),
            "cw" => Some(Self::ContinuousWave),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "trigger",
            Self::Interval => "interval",
            Self::TriggerTest => "test",
            Self::Alignment => "align",
            Self::ContinuousWave => "cw",
        }
    }

    /// Whether the mode engages the camera at all.
    pub(crate) fn uses_camera(&self) -> bool {
        matches!(self, Self::Triggered | Self::Interval | Self::Alignment)
    }

    /// Whether the controller fires the board itself on a timer.
    pub(crate) fn is_timed(&self) -> bool {
        matches!(self, Self::Interval | Self::Alignment)
    }

    pub(crate) fn trigger_source(&self) -> TriggerSource {
        if self.is_timed() {
            TriggerSource::ProgramDriven
        } else {
            TriggerSource::SensorDriven
        }
    }
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating point of the PMT discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalibrationResult {
    pub(crate) gain: u8,
    pub(crate) threshold: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CalibrationStrategy {
    BinarySearch,
    LinearSweep,
}

impl CalibrationStrategy {
    pub(crate) fn from_str(strategy: &str) -> Option<Self> {
        match strategy.trim().to_lowercase().as_str() {
            "binary" => Some(Self::BinarySearch),
            "linear" => Some(Self::LinearSweep),
            _ => None,
        }
    }
}

/// Current UTC time formatted as YYYY_MM_DD-HH_MM_SS.
pub(crate) fn str_time() -> String {
    let format =
        time::macros::format_description!("[year]_[month]_[day]-[hour]_[minute]_[second]");
    time::OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_else(|_| String::from("unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_token_is_shared_between_clones() {
        let token = ShutdownToken::new();
        let reader = token.clone();
        assert!(!reader.is_requested());
        token.request();
        assert!(reader.is_requested());
    }

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!(
            AcquisitionMode::from_str("Interval"),
            Some(AcquisitionMode::Interval)
        );
        assert_eq!(
            AcquisitionMode::from_str("TEST"),
            Some(AcquisitionMode::TriggerTest)
        );
        assert_eq!(AcquisitionMode::from_str("burst"), None);
    }

    #[test]
    fn timed_modes_drive_the_trigger_from_the_program() {
        assert_eq!(
            AcquisitionMode::Interval.trigger_source(),
            TriggerSource::ProgramDriven
        );
        assert_eq!(
            AcquisitionMode::Alignment.trigger_source(),
            TriggerSource::ProgramDriven
        );
        assert_eq!(
            AcquisitionMode::Triggered.trigger_source(),
            TriggerSource::SensorDriven
        );
        assert!(!AcquisitionMode::TriggerTest.uses_camera());
        assert!(!AcquisitionMode::ContinuousWave.uses_camera());
    }

    #[test]
    fn str_time_has_the_run_stamp_shape() {
        let stamp = str_time();
        assert_eq!(stamp.len(), "2024_01_31-12_00_00".len());
        assert_eq!(&stamp[4..5], "_");
        assert_eq!(&stamp[10..11], "-");
    }
}

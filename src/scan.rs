//! Duty-cycled passive scanning.
//!
//! [`ScanSession`] is pure bookkeeping over `Instant`s: the event loop asks it
//! when to wake next, calls [`ScanSession::poll`] on wake-up, and forwards the
//! returned commands to the radio.

use crate::device::DeviceAddress;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_millis(5000);

/// Shortest interval a session will schedule with; shorter ones are raised
/// to this.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Time between the starts of consecutive windows.
    pub interval: Duration,
    /// How long each window stays open.
    pub window: Duration,
}

impl ScanConfig {
    pub fn new(interval: Duration, window: Duration) -> Self {
        Self { interval, window }.normalized()
    }

    pub fn with_interval_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs), DEFAULT_SCAN_WINDOW)
    }

    fn normalized(self) -> Self {
        Self {
            interval: self.interval.max(MIN_SCAN_INTERVAL),
            ..self
        }
    }

    /// The window, cut down to the interval so it closes no later than the
    /// next one opens.
    pub fn effective_window(&self) -> Duration {
        self.window.min(self.interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    OpenWindow,
    CloseWindow,
}

#[derive(Debug)]
pub struct ScanSession {
    config: ScanConfig,
    running: bool,
    /// Set while a window is open.
    window_deadline: Option<Instant>,
    next_window: Option<Instant>,
    /// Devices already reported in the current window.
    reported: HashSet<DeviceAddress>,
    windows_opened: u64,
}

impl ScanSession {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config: config.normalized(),
            running: false,
            window_deadline: None,
            next_window: None,
            reported: HashSet::new(),
            windows_opened: 0,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True while a scan window is open.
    pub fn is_active(&self) -> bool {
        self.window_deadline.is_some()
    }

    pub fn windows_opened(&self) -> u64 {
        self.windows_opened
    }

    /// Opens the first window now and schedules the rest. No-op if running.
    pub fn start(&mut self, now: Instant) -> Vec<ScanCommand> {
        if self.running {
            return Vec::new();
        }
        info!(
            interval = ?self.config.interval,
            window = ?self.config.effective_window(),
            "scan scheduler started"
        );
        self.running = true;
        self.next_window = Some(now + self.config.interval);
        let mut commands = Vec::new();
        self.open_window(now, &mut commands);
        commands
    }

    /// Cancels future windows and closes the open one, if any.
    pub fn stop(&mut self) -> Vec<ScanCommand> {
        let mut commands = Vec::new();
        if self.running {
            info!(windows = self.windows_opened, "scan scheduler stopped");
        }
        self.running = false;
        self.next_window = None;
        self.close_window(&mut commands);
        commands
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.window_deadline, self.next_window) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires whichever timers are due at `now`. A close due at the same
    /// instant as an open is handled first.
    pub fn poll(&mut self, now: Instant) -> Vec<ScanCommand> {
        let mut commands = Vec::new();
        if self.window_deadline.is_some_and(|deadline| deadline <= now) {
            self.close_window(&mut commands);
        }
        if let Some(due) = self.next_window.filter(|&due| self.running && due <= now) {
            let mut next = due + self.config.interval;
            while next <= now {
                next += self.config.interval;
            }
            self.next_window = Some(next);
            self.open_window(now, &mut commands);
        }
        commands
    }

    /// Whether a frame from `address` should be decoded right now.
    pub fn wants(&self, address: &DeviceAddress) -> bool {
        self.is_active() && !self.reported.contains(address)
    }

    /// Marks `address` as reported for the rest of the current window.
    pub fn mark_reported(&mut self, address: DeviceAddress) {
        if self.is_active() {
            self.reported.insert(address);
        }
    }

    fn open_window(&mut self, now: Instant, commands: &mut Vec<ScanCommand>) {
        if self.is_active() {
            self.close_window(commands);
        }
        self.windows_opened += 1;
        self.window_deadline = Some(now + self.config.effective_window());
        debug!(window = self.windows_opened, "scan window open");
        commands.push(ScanCommand::OpenWindow);
    }

    fn close_window(&mut self, commands: &mut Vec<ScanCommand>) {
        if self.window_deadline.take().is_some() {
            debug!(
                window = self.windows_opened,
                reported = self.reported.len(),
                "scan window closed"
            );
            self.reported.clear();
            commands.push(ScanCommand::CloseWindow);
        }
    }
}

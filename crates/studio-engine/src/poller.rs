use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::client::{VideoJobHandle, VideoOperationStatus};
use crate::error::{ActionError, ActionResult};

/// Progress lines shown while a video job runs, cycled once per poll.
pub const VIDEO_PROGRESS_MESSAGES: &[&str] = &[
    "Starting video generation...",
    "The model is warming up its engines...",
    "Rendering the first frames...",
    "Adding special effects...",
    "Compiling the masterpiece...",
    "Almost there, the robots are adding the final touches...",
];

pub const VIDEO_DOWNLOAD_MESSAGE: &str = "Downloading the generated video...";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PollerState {
    #[default]
    Idle,
    Submitted,
    Polling,
    Downloading,
    Completed,
    Failed(String),
}

impl PollerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollerState::Idle => "idle",
            PollerState::Submitted => "submitted",
            PollerState::Polling => "polling",
            PollerState::Downloading => "downloading",
            PollerState::Completed => "completed",
            PollerState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVideoOperation {
    pub handle: VideoJobHandle,
    pub done: bool,
    pub result: Option<String>,
}

/// What the driver does after a status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    /// Not done yet; wait and poll again.
    Continue,
    /// Done with a result; fetch it.
    Download(String),
    /// Done without a usable result.
    Fail(String),
}

/// Single-slot state machine for one long-running video job.
///
/// The machine itself does no I/O. A driver feeds it status results and
/// reports the download outcome; every terminal transition empties the slot.
#[derive(Debug, Clone, Default)]
pub struct VideoOperationPoller {
    state: PollerState,
    pending: Option<PendingVideoOperation>,
    message_index: usize,
    polls: u32,
}

impl VideoOperationPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    pub fn pending(&self) -> Option<&PendingVideoOperation> {
        self.pending.as_ref()
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn is_in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn message(&self) -> &'static str {
        if self.state == PollerState::Downloading {
            return VIDEO_DOWNLOAD_MESSAGE;
        }
        VIDEO_PROGRESS_MESSAGES[self.message_index % VIDEO_PROGRESS_MESSAGES.len()]
    }

    /// `idle -> submitted`. A second job while one is in flight is rejected.
    pub fn submit(&mut self, handle: VideoJobHandle) -> ActionResult<()> {
        if self.is_in_flight() {
            return Err(ActionError::Busy);
        }
        self.pending = Some(PendingVideoOperation {
            handle,
            done: false,
            result: None,
        });
        self.state = PollerState::Submitted;
        self.message_index = 0;
        self.polls = 0;
        Ok(())
    }

    /// Applies one status check result.
    pub fn record_status(&mut self, status: VideoOperationStatus) -> PollStep {
        let Some(pending) = self.pending.as_mut() else {
            return PollStep::Fail("no video job in flight".to_string());
        };
        self.polls += 1;
        if !status.done {
            self.state = PollerState::Polling;
            self.message_index = (self.message_index + 1) % VIDEO_PROGRESS_MESSAGES.len();
            return PollStep::Continue;
        }
        pending.done = true;
        pending.result = status.result_locator.clone();
        match status.result_locator {
            Some(locator) => {
                self.state = PollerState::Downloading;
                PollStep::Download(locator)
            }
            None => {
                let detail = status
                    .error
                    .map(|message| format!(": {message}"))
                    .unwrap_or_default();
                let message =
                    format!("Video generation failed or did not return a download link{detail}");
                self.fail(message.clone());
                PollStep::Fail(message)
            }
        }
    }

    pub fn complete(&mut self) {
        self.pending = None;
        self.state = PollerState::Completed;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.pending = None;
        self.state = PollerState::Failed(message.into());
    }

    /// Drops the in-flight job without a terminal result.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.state = PollerState::Idle;
        self.message_index = 0;
        self.polls = 0;
    }
}

/// Shared cancel flag that also wakes a sleeping waiter.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        match flag.lock() {
            Ok(mut cancelled) => *cancelled = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        match flag.lock() {
            Ok(cancelled) => *cancelled,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleeps up to `timeout`, returning early on cancellation.
    /// Returns `true` when the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let Ok(mut cancelled) = flag.lock() else {
            return true;
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match signal.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return true,
            }
        }
        *cancelled
    }
}

/// Timer used between status checks.
pub trait Scheduler: Send + Sync {
    /// Waits `interval` unless `token` is cancelled first.
    /// Returns `false` when the wait ended because of cancellation.
    fn wait(&self, interval: Duration, token: &CancellationToken) -> bool;
}

/// Real-time scheduler that sleeps on the token's condvar.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn wait(&self, interval: Duration, token: &CancellationToken) -> bool {
        !token.wait_timeout(interval)
    }
}

/// Scheduler that never sleeps; used for offline runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn wait(&self, _interval: Duration, token: &CancellationToken) -> bool {
        !token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn handle() -> VideoJobHandle {
        VideoJobHandle {
            name: "operations/1".to_string(),
        }
    }

    fn pending_status() -> VideoOperationStatus {
        VideoOperationStatus::default()
    }

    #[test]
    fn message_rotation_wraps_after_full_cycle() -> anyhow::Result<()> {
        let mut poller = VideoOperationPoller::new();
        poller.submit(handle())?;
        assert_eq!(poller.message(), VIDEO_PROGRESS_MESSAGES[0]);

        for idx in 1..VIDEO_PROGRESS_MESSAGES.len() {
            assert_eq!(poller.record_status(pending_status()), PollStep::Continue);
            assert_eq!(poller.message(), VIDEO_PROGRESS_MESSAGES[idx]);
        }
        poller.record_status(pending_status());
        assert_eq!(poller.message(), VIDEO_PROGRESS_MESSAGES[0]);
        assert_eq!(poller.polls() as usize, VIDEO_PROGRESS_MESSAGES.len());
        assert_eq!(poller.state(), &PollerState::Polling);
        Ok(())
    }

    #[test]
    fn second_submit_while_in_flight_is_busy() -> anyhow::Result<()> {
        let mut poller = VideoOperationPoller::new();
        poller.submit(handle())?;
        assert_eq!(poller.submit(handle()), Err(ActionError::Busy));
        Ok(())
    }

    #[test]
    fn done_with_locator_moves_to_downloading() -> anyhow::Result<()> {
        let mut poller = VideoOperationPoller::new();
        poller.submit(handle())?;
        let step = poller.record_status(VideoOperationStatus {
            done: true,
            result_locator: Some("https://x/v.mp4".to_string()),
            error: None,
        });
        assert_eq!(step, PollStep::Download("https://x/v.mp4".to_string()));
        assert_eq!(poller.state(), &PollerState::Downloading);
        assert_eq!(poller.message(), VIDEO_DOWNLOAD_MESSAGE);
        assert_eq!(
            poller.pending().and_then(|pending| pending.result.clone()),
            Some("https://x/v.mp4".to_string())
        );

        poller.complete();
        assert!(!poller.is_in_flight());
        assert_eq!(poller.state(), &PollerState::Completed);
        Ok(())
    }

    #[test]
    fn done_without_locator_fails_and_frees_slot() -> anyhow::Result<()> {
        let mut poller = VideoOperationPoller::new();
        poller.submit(handle())?;
        let step = poller.record_status(VideoOperationStatus {
            done: true,
            result_locator: None,
            error: Some("quota".to_string()),
        });
        assert!(matches!(step, PollStep::Fail(ref message) if message.ends_with(": quota")));
        assert!(!poller.is_in_flight());
        assert_eq!(poller.state().as_str(), "failed");
        poller.submit(handle())?;
        Ok(())
    }

    #[test]
    fn cancelled_token_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || ThreadScheduler.wait(Duration::from_secs(30), &token))
        };
        token.cancel();
        assert_eq!(waiter.join().ok(), Some(false));
        assert!(token.is_cancelled());
    }

    #[test]
    fn uncancelled_wait_runs_to_timeout() {
        let token = CancellationToken::new();
        assert!(ThreadScheduler.wait(Duration::from_millis(5), &token));
        assert!(ImmediateScheduler.wait(Duration::from_secs(30), &token));
        token.cancel();
        assert!(!ImmediateScheduler.wait(Duration::ZERO, &token));
    }
}

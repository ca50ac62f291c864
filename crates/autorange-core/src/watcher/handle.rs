//! Caller side of a watcher's mailboxes

use super::{RunState, WatcherReport};
use crate::models::{AugmentedSample, UsageSample};
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, watch};

/// Feeds samples into a watcher, reads its augmented outputs and drives
/// pause/resume.
///
/// Both mailboxes hold a single value. Offering a sample while the previous
/// one is still unread drops the new sample; the watcher drops outputs the
/// same way when nobody reads them.
pub struct WatcherHandle {
    input: mpsc::Sender<UsageSample>,
    output: mpsc::Receiver<AugmentedSample>,
    control: watch::Sender<RunState>,
    report: watch::Receiver<WatcherReport>,
}

impl WatcherHandle {
    pub(super) fn new(
        input: mpsc::Sender<UsageSample>,
        output: mpsc::Receiver<AugmentedSample>,
        control: watch::Sender<RunState>,
        report: watch::Receiver<WatcherReport>,
    ) -> Self {
        Self {
            input,
            output,
            control,
            report,
        }
    }

    /// Non-blocking offer. Returns false when the sample was dropped because
    /// the mailbox is full or the watcher has stopped.
    pub fn offer(&self, sample: UsageSample) -> bool {
        match self.input.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Wait for the mailbox slot and deliver the sample
    pub async fn send(&self, sample: UsageSample) -> Result<(), SendError<UsageSample>> {
        self.input.send(sample).await
    }

    /// Take the most recent augmented sample, if one is waiting
    pub fn try_latest(&mut self) -> Option<AugmentedSample> {
        let mut latest = None;
        while let Ok(sample) = self.output.try_recv() {
            latest = Some(sample);
        }
        latest
    }

    /// Ask the watcher to hold at its next tick boundary, keeping all state
    pub fn pause(&self) {
        self.control.send_replace(RunState::Paused);
    }

    pub fn resume(&self) {
        self.control.send_replace(RunState::Running);
    }

    pub fn is_paused(&self) -> bool {
        *self.control.borrow() == RunState::Paused
    }

    /// Latest status published by the watcher
    pub fn report(&self) -> WatcherReport {
        self.report.borrow().clone()
    }

    /// Separate receiver for status updates, usable after the handle is moved
    pub fn subscribe(&self) -> watch::Receiver<WatcherReport> {
        self.report.clone()
    }
}

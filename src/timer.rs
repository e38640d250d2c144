use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::net::{Scheduler, Timer, TimerKind};

/// A [`Scheduler`] backed by tokio sleeps.
///
/// Elapsed timers are pushed onto a queue; whoever drains it hands them to the
/// session, which keeps timer handling on a single task.
#[derive(Debug)]
pub struct TokioScheduler {
    runtime: Handle,
    fired: UnboundedSender<Timer>,
    deadline: Option<JoinHandle<()>>,
    settle: Option<JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle, fired: UnboundedSender<Timer>) -> Self {
        Self {
            runtime,
            fired,
            deadline: None,
            settle: None,
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            TimerKind::Deadline => &mut self.deadline,
            TimerKind::Settle => &mut self.settle,
        }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        let fired = self.fired.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let _ = fired.send(timer);
        });
        if let Some(previous) = self.slot(timer.kind).replace(handle) {
            previous.abort();
        }
    }

    fn disarm(&mut self, kind: TimerKind) {
        if let Some(pending) = self.slot(kind).take() {
            pending.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.disarm(TimerKind::Deadline);
        self.disarm(TimerKind::Settle);
    }
}

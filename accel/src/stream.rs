/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::AccelError;
use crate::DeviceIndex;
use crate::StreamFault;

type Work = Box<dyn FnOnce() -> Result<(), StreamFault> + Send + 'static>;

enum Command {
    Run { op: String, work: Work },
    Record(Event),
}

/// The first failure seen on a stream. Like device errors on real hardware
/// it is sticky: once set, all later work on the stream is skipped.
#[derive(Debug, Clone)]
struct Fault {
    op: String,
    message: String,
}

/// An ordered execution queue on a device.
///
/// Work enqueued on a stream runs on the stream's worker in submission order,
/// asynchronously with respect to the thread that enqueued it. Completion is
/// observed through an [`Event`] recorded after the work, or by draining the
/// whole stream with [`Stream::synchronize`].
pub struct Stream {
    device: DeviceIndex,
    fault: Arc<Mutex<Option<Fault>>>,
    sender: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(device: DeviceIndex) -> Result<Self, AccelError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let fault = Arc::new(Mutex::new(None));
        let worker_fault = fault.clone();
        let worker = std::thread::Builder::new()
            .name(format!("stream-{}", device.0))
            .spawn(move || run_worker(device, receiver, worker_fault))
            .map_err(|source| AccelError::StreamCreation { device, source })?;
        Ok(Self {
            device,
            fault,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Queue `work` to run after everything previously queued on this stream.
    /// Returns as soon as the work is queued.
    pub fn enqueue<F>(&self, op: impl Into<String>, work: F) -> Result<(), AccelError>
    where
        F: FnOnce() -> Result<(), StreamFault> + Send + 'static,
    {
        if let Some(fault) = self.fault.lock().clone() {
            return Err(AccelError::PriorLaunchFailure {
                op: fault.op,
                message: fault.message,
            });
        }
        self.send(Command::Run {
            op: op.into(),
            work: Box::new(work),
        })
    }

    /// Record an event that completes once all work queued so far has run.
    pub fn record_event(&self) -> Result<Event, AccelError> {
        let event = Event::new(self.device);
        self.send(Command::Record(event.clone()))?;
        Ok(event)
    }

    /// Check if all work submitted to this stream has completed.
    pub fn query(&self) -> Result<bool, AccelError> {
        Ok(self.record_event()?.query())
    }

    /// Block until all work queued on this stream has completed, returning
    /// the stream's failure if any queued work failed.
    pub fn synchronize(&self) -> Result<(), AccelError> {
        self.record_event()?.synchronize()
    }

    fn send(&self, command: Command) -> Result<(), AccelError> {
        self.sender
            .as_ref()
            .ok_or(AccelError::StreamClosed(self.device))?
            .send(command)
            .map_err(|_| AccelError::StreamClosed(self.device))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the queued work and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("stream worker on {} panicked", self.device);
            }
        }
    }
}

fn run_worker(
    device: DeviceIndex,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    fault: Arc<Mutex<Option<Fault>>>,
) {
    while let Some(command) = receiver.blocking_recv() {
        match command {
            Command::Run { op, work } => {
                if fault.lock().is_some() {
                    tracing::debug!("{}: skipping {} after an earlier failure", device, op);
                    continue;
                }
                if let Err(err) = work() {
                    tracing::error!("{}: {} failed: {}", device, op, err);
                    *fault.lock() = Some(Fault {
                        op,
                        message: err.to_string(),
                    });
                }
            }
            Command::Record(event) => event.complete(fault.lock().clone()),
        }
    }
}

#[derive(Debug)]
enum EventState {
    Pending,
    Complete,
    Failed(Fault),
}

struct EventInner {
    device: DeviceIndex,
    state: Mutex<EventState>,
    condvar: Condvar,
    notify: Notify,
}

/// A completion marker recorded on a [`Stream`].
///
/// The event completes once all work queued on its stream before it was
/// recorded has run. Clones share the same state.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.inner.device)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl Event {
    fn new(device: DeviceIndex) -> Self {
        Self {
            inner: Arc::new(EventInner {
                device,
                state: Mutex::new(EventState::Pending),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn complete(&self, fault: Option<Fault>) {
        *self.inner.state.lock() = match fault {
            None => EventState::Complete,
            Some(fault) => EventState::Failed(fault),
        };
        self.inner.condvar.notify_all();
        self.inner.notify.notify_waiters();
    }

    fn result(&self, state: &EventState) -> Option<Result<(), AccelError>> {
        match state {
            EventState::Pending => None,
            EventState::Complete => Some(Ok(())),
            EventState::Failed(fault) => Some(Err(AccelError::LaunchFailure {
                device: self.inner.device,
                op: fault.op.clone(),
                message: fault.message.clone(),
            })),
        }
    }

    /// Check if all work captured by this event has completed.
    pub fn query(&self) -> bool {
        !matches!(*self.inner.state.lock(), EventState::Pending)
    }

    /// Block the calling thread until the event completes.
    pub fn synchronize(&self) -> Result<(), AccelError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(result) = self.result(&state) {
                return result;
            }
            self.inner.condvar.wait(&mut state);
        }
    }

    /// Like [`Event::synchronize`], but gives up after `timeout`, returning
    /// `None` if the event is still pending.
    pub fn synchronize_timeout(&self, timeout: Duration) -> Option<Result<(), AccelError>> {
        let mut state = self.inner.state.lock();
        if let Some(result) = self.result(&state) {
            return Some(result);
        }
        self.inner.condvar.wait_for(&mut state, timeout);
        self.result(&state)
    }

    /// Wait for the event without blocking the async runtime.
    pub async fn wait(&self) -> Result<(), AccelError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result(&self.inner.state.lock()) {
                return result;
            }
            notified.await;
        }
    }
}

//! Bounded worker pool receiving from one subscription.
//!
//! - `max_concurrent_calls` worker threads share one receiver, so at most that
//!   many messages are in flight at once
//! - Completion is manual: the message callback decides when to call
//!   [`ProcessMessageArgs::complete`]
//! - A callback error (or panic) is handed to the error callback and the message
//!   is left locked; the broker redelivers it once the lock expires
//! - Receive failures are reported the same way and the worker keeps polling
//! - With a [`ReceiverFactory`], a receiver whose client was closed is replaced
//!   by a fresh one instead of failing every receive

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use eventbus_events::DispatchError;

use crate::broker::{BrokerError, MessageReceiver, ReceivedMessage};

pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 10;
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Worker threads, i.e. maximum messages in flight.
    pub max_concurrent_calls: usize,
    /// How long one receive call waits before re-checking for shutdown.
    pub receive_timeout: Duration,
    /// Thread name prefix and log field.
    pub name: String,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            name: "message-processor".to_string(),
        }
    }
}

impl ProcessorOptions {
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorSource {
    Receive,
    ProcessMessageCallback,
    Complete,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSource::Receive => "Receive",
            ErrorSource::ProcessMessageCallback => "ProcessMessageCallback",
            ErrorSource::Complete => "Complete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("message handler panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("max_concurrent_calls must be at least 1")]
    NoWorkers,

    #[error("failed to spawn processor thread: {0}")]
    Spawn(#[from] io::Error),
}

/// One received message plus the means to settle it.
pub struct ProcessMessageArgs<'a> {
    message: &'a ReceivedMessage,
    receiver: &'a dyn MessageReceiver,
    completed: Cell<bool>,
    completion_failed: Cell<bool>,
}

impl<'a> ProcessMessageArgs<'a> {
    fn new(message: &'a ReceivedMessage, receiver: &'a dyn MessageReceiver) -> Self {
        Self {
            message,
            receiver,
            completed: Cell::new(false),
            completion_failed: Cell::new(false),
        }
    }

    pub fn message(&self) -> &ReceivedMessage {
        self.message
    }

    /// Settle the message so it is not redelivered.
    pub fn complete(&self) -> Result<(), BrokerError> {
        match self.receiver.complete(self.message) {
            Ok(()) => {
                self.completed.set(true);
                Ok(())
            }
            Err(e) => {
                self.completion_failed.set(true);
                Err(e)
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }
}

/// Error report handed to the error callback.
#[derive(Debug)]
pub struct ProcessErrorArgs {
    pub error: ProcessError,
    pub source: ErrorSource,
    pub entity_path: String,
    pub message_id: Option<String>,
}

pub type MessageCallback =
    Arc<dyn Fn(&ProcessMessageArgs<'_>) -> Result<(), ProcessError> + Send + Sync>;

pub type ErrorCallback = Arc<dyn Fn(&ProcessErrorArgs) + Send + Sync>;

/// Opens a replacement receiver for the same subscription.
pub type ReceiverFactory =
    Arc<dyn Fn() -> Result<Arc<dyn MessageReceiver>, BrokerError> + Send + Sync>;

pub fn receiver_factory<F>(f: F) -> ReceiverFactory
where
    F: Fn() -> Result<Arc<dyn MessageReceiver>, BrokerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn message_callback<F>(f: F) -> MessageCallback
where
    F: Fn(&ProcessMessageArgs<'_>) -> Result<(), ProcessError> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn error_callback<F>(f: F) -> ErrorCallback
where
    F: Fn(&ProcessErrorArgs) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    pub messages_received: u64,
    pub messages_completed: u64,
    pub messages_failed: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StatsCounters {
    fn enter(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The receiver shared by all workers.
struct ReceiverSlot {
    current: Mutex<Arc<dyn MessageReceiver>>,
    reopen: Option<ReceiverFactory>,
}

impl ReceiverSlot {
    fn current(&self) -> Arc<dyn MessageReceiver> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn can_reopen(&self) -> bool {
        self.reopen.is_some()
    }

    /// Replace `closed`, unless another worker already has.
    fn reopen(&self, closed: &Arc<dyn MessageReceiver>) -> Result<(), BrokerError> {
        let Some(reopen) = &self.reopen else {
            return Err(BrokerError::Closed);
        };
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::ptr_eq(&current, closed) {
            *current = reopen()?;
        }
        Ok(())
    }
}

struct Worker {
    name: String,
    entity_path: String,
    receivers: Arc<ReceiverSlot>,
    receive_timeout: Duration,
    on_message: MessageCallback,
    on_error: ErrorCallback,
    shutdown: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
}

/// Handle to a running pool of receive workers.
pub struct MessageProcessor {
    name: String,
    entity_path: String,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<StatsCounters>,
    started: Instant,
}

impl MessageProcessor {
    /// Spawn `max_concurrent_calls` workers pulling from `receiver`.
    pub fn start(
        receiver: Arc<dyn MessageReceiver>,
        options: ProcessorOptions,
        on_message: MessageCallback,
        on_error: ErrorCallback,
    ) -> Result<Self, ProcessorError> {
        Self::spawn(receiver, None, options, on_message, on_error)
    }

    /// Like [`MessageProcessor::start`], replacing `receiver` through `reopen`
    /// whenever a receive reports [`BrokerError::Closed`].
    pub fn start_reopening(
        receiver: Arc<dyn MessageReceiver>,
        reopen: ReceiverFactory,
        options: ProcessorOptions,
        on_message: MessageCallback,
        on_error: ErrorCallback,
    ) -> Result<Self, ProcessorError> {
        Self::spawn(receiver, Some(reopen), options, on_message, on_error)
    }

    fn spawn(
        receiver: Arc<dyn MessageReceiver>,
        reopen: Option<ReceiverFactory>,
        options: ProcessorOptions,
        on_message: MessageCallback,
        on_error: ErrorCallback,
    ) -> Result<Self, ProcessorError> {
        if options.max_concurrent_calls == 0 {
            return Err(ProcessorError::NoWorkers);
        }

        let processor = Self {
            name: options.name.clone(),
            entity_path: receiver.entity_path(),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::with_capacity(options.max_concurrent_calls)),
            stats: Arc::new(StatsCounters::default()),
            started: Instant::now(),
        };
        let receivers = Arc::new(ReceiverSlot {
            current: Mutex::new(receiver),
            reopen,
        });

        for index in 0..options.max_concurrent_calls {
            let worker = Worker {
                name: options.name.clone(),
                entity_path: processor.entity_path.clone(),
                receivers: receivers.clone(),
                receive_timeout: options.receive_timeout,
                on_message: on_message.clone(),
                on_error: on_error.clone(),
                shutdown: processor.shutdown.clone(),
                stats: processor.stats.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", options.name))
                .spawn(move || worker.run());

            match spawned {
                Ok(join) => processor.lock_workers().push(join),
                Err(e) => {
                    processor.close();
                    return Err(ProcessorError::Spawn(e));
                }
            }
        }

        info!(
            processor = %processor.name,
            entity_path = %processor.entity_path,
            max_concurrent_calls = options.max_concurrent_calls,
            "message processor started"
        );
        Ok(processor)
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop receiving and wait for in-flight messages. Safe to call more than once.
    pub fn close(&self) {
        let first = !self.shutdown.swap(true, Ordering::SeqCst);
        let workers: Vec<_> = self.lock_workers().drain(..).collect();

        let current = thread::current().id();
        for join in workers {
            // A handler closing the bus must not join its own thread.
            if join.thread().id() != current {
                let _ = join.join();
            }
        }

        if first {
            info!(processor = %self.name, entity_path = %self.entity_path, "message processor stopped");
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            messages_received: self.stats.received.load(Ordering::SeqCst),
            messages_completed: self.stats.completed.load(Ordering::SeqCst),
            messages_failed: self.stats.failed.load(Ordering::SeqCst),
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.stats.peak_in_flight.load(Ordering::SeqCst),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MessageProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("name", &self.name)
            .field("entity_path", &self.entity_path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Worker {
    fn run(self) {
        debug!(processor = %self.name, "worker started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let receiver = self.receivers.current();
            match receiver.receive(self.receive_timeout) {
                Ok(Some(message)) => self.handle(receiver.as_ref(), &message),
                Ok(None) => {}
                Err(_) if self.shutdown.load(Ordering::SeqCst) => break,
                Err(BrokerError::Closed) if self.receivers.can_reopen() => {
                    match self.receivers.reopen(&receiver) {
                        Ok(()) => debug!(processor = %self.name, "receiver closed, reopened"),
                        Err(e) => {
                            self.report(ProcessError::Broker(e), ErrorSource::Receive, None);
                            thread::sleep(self.receive_timeout);
                        }
                    }
                }
                Err(e) => {
                    self.report(ProcessError::Broker(e), ErrorSource::Receive, None);
                    thread::sleep(self.receive_timeout);
                }
            }
        }

        debug!(processor = %self.name, "worker stopped");
    }

    fn handle(&self, receiver: &dyn MessageReceiver, message: &ReceivedMessage) {
        self.stats.enter();

        let args = ProcessMessageArgs::new(message, receiver);
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.on_message)(&args)))
            .unwrap_or_else(|payload| Err(ProcessError::Panicked(panic_message(payload))));

        match result {
            Ok(()) => {
                if args.is_completed() {
                    self.stats.completed.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(error) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                let source = if args.completion_failed.get() {
                    ErrorSource::Complete
                } else {
                    ErrorSource::ProcessMessageCallback
                };
                self.report(error, source, Some(message.message_id().to_string()));
            }
        }

        self.stats.leave();
    }

    fn report(&self, error: ProcessError, source: ErrorSource, message_id: Option<String>) {
        let args = ProcessErrorArgs {
            error,
            source,
            entity_path: self.entity_path.clone(),
            message_id,
        };
        // The error callback must not take the worker down with it.
        if panic::catch_unwind(AssertUnwindSafe(|| (self.on_error)(&args))).is_err() {
            debug!(processor = %self.name, "error callback panicked");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

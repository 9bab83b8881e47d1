use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{error::catch_adapter_panic, Error, Result, SdkMetadata};

use super::{
    dedupe::{ExposureDedupe, DEDUPE_WINDOW},
    EventLoggingAdapter, Event, Exposure, LogEventRequest,
};

enum Command {
    /// Flush now, acknowledging on the sender if one is given.
    Flush(Option<mpsc::SyncSender<()>>),
    Shutdown(mpsc::SyncSender<()>),
}

/// Bounded event queue flushed by a background thread.
///
/// Events are flushed once `batch_size` of them are queued, every `flush_interval`, on
/// [`EventLogger::flush`] and on shutdown. Each request carries at most `batch_size` events. When
/// the queue holds `max_queue_size` events the oldest one is dropped and counted.
pub struct EventLogger {
    queue: Mutex<VecDeque<Event>>,
    max_queue_size: usize,
    batch_size: usize,
    dropped: AtomicU64,
    dedupe: ExposureDedupe,
    adapter: Arc<dyn EventLoggingAdapter>,
    metadata: SdkMetadata,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    /// Set while a size-triggered flush is pending, so a burst of logs sends one signal.
    flush_requested: AtomicBool,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    is_shut_down: AtomicBool,
}

impl fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogger")
            .field("max_queue_size", &self.max_queue_size)
            .field("batch_size", &self.batch_size)
            .field("queued", &self.queued_len())
            .field("dropped", &self.dropped_events_count())
            .finish_non_exhaustive()
    }
}

impl EventLogger {
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 2000;
    pub const DEFAULT_BATCH_SIZE: usize = 500;
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

    /// Create a logger and start its flush thread. `batch_size` is capped at `max_queue_size`.
    pub fn start(
        adapter: Arc<dyn EventLoggingAdapter>,
        metadata: SdkMetadata,
        max_queue_size: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<Arc<EventLogger>> {
        if let Err(err) = catch_adapter_panic("event logging adapter start", || adapter.start()) {
            log::warn!(target: "switchyard", "event logging adapter failed to start: {err}");
        }

        let max_queue_size = max_queue_size.max(1);
        let logger = Arc::new(EventLogger {
            queue: Mutex::new(VecDeque::new()),
            max_queue_size,
            batch_size: batch_size.clamp(1, max_queue_size),
            dropped: AtomicU64::new(0),
            dedupe: ExposureDedupe::new(DEDUPE_WINDOW),
            adapter,
            metadata,
            commands: Mutex::new(None),
            flush_requested: AtomicBool::new(false),
            join_handle: Mutex::new(None),
            is_shut_down: AtomicBool::new(false),
        });

        let (sender, receiver) = mpsc::channel();
        let join_handle = {
            let logger = Arc::downgrade(&logger);
            std::thread::Builder::new()
                .name("switchyard-event-logger".to_owned())
                .spawn(move || loop {
                    let command = match receiver.recv_timeout(flush_interval) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return,
                    };
                    let Some(logger) = logger.upgrade() else {
                        return;
                    };
                    match command {
                        None => logger.flush_queue(),
                        Some(Command::Flush(ack)) => {
                            logger.flush_requested.store(false, Ordering::Release);
                            logger.flush_queue();
                            if let Some(ack) = ack {
                                let _ = ack.try_send(());
                            }
                        }
                        Some(Command::Shutdown(ack)) => {
                            logger.flush_queue();
                            let adapter = &logger.adapter;
                            if let Err(err) = catch_adapter_panic("event logging adapter shutdown", || adapter.shutdown()) {
                                log::warn!(target: "switchyard", "event logging adapter failed to shut down: {err}");
                            }
                            let _ = ack.try_send(());
                            return;
                        }
                    }
                })?
        };

        if let Ok(mut commands) = logger.commands.lock() {
            *commands = Some(sender);
        }
        if let Ok(mut slot) = logger.join_handle.lock() {
            *slot = Some(join_handle);
        }
        Ok(logger)
    }

    /// Enqueue an event. Never blocks on I/O.
    pub fn enqueue(&self, event: Event) {
        if self.is_shut_down.load(Ordering::Acquire) {
            return;
        }

        let len = {
            let Ok(mut queue) = self.queue.lock() else {
                return;
            };
            if queue.len() >= self.max_queue_size {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
            queue.len()
        };

        if len >= self.batch_size && !self.flush_requested.swap(true, Ordering::AcqRel) {
            self.send(Command::Flush(None));
        }
    }

    /// Enqueue an exposure unless an identical one was logged recently.
    pub(crate) fn enqueue_exposure(&self, exposure: Exposure) {
        if self.dedupe.should_log(&exposure.key) {
            self.enqueue(exposure.event);
        }
    }

    /// Flush queued events and wait up to `timeout` for the batches to be handed to the adapter.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the adapter is still busy when `timeout` elapses, and
    /// [`Error::ThreadPanicked`] if the flush thread is gone.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        if self.is_shut_down.load(Ordering::Acquire) {
            return Ok(());
        }
        let (ack_sender, ack_receiver) = mpsc::sync_channel(1);
        if !self.send(Command::Flush(Some(ack_sender))) {
            return Err(Error::ThreadPanicked);
        }
        ack_receiver
            .recv_timeout(timeout)
            .map_err(|_| Error::Timeout {
                operation: "event flush",
                timeout,
            })
    }

    /// Flush remaining events and stop the flush thread. Later calls are no-ops.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (ack_sender, ack_receiver) = mpsc::sync_channel(1);
        self.send(Command::Shutdown(ack_sender));
        if let Ok(mut commands) = self.commands.lock() {
            commands.take();
        }

        ack_receiver
            .recv_timeout(timeout)
            .map_err(|_| Error::Timeout {
                operation: "event logger shutdown",
                timeout,
            })?;

        let join_handle = self.join_handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(join_handle) = join_handle {
            join_handle.join().map_err(|_| Error::ThreadPanicked)?;
        }
        Ok(())
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_events_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, command: Command) -> bool {
        self.commands
            .lock()
            .ok()
            .and_then(|commands| commands.as_ref().map(|sender| sender.send(command).is_ok()))
            .unwrap_or(false)
    }

    /// Send everything queued when the flush starts, `batch_size` events per request. Events
    /// logged meanwhile wait for the next flush.
    fn flush_queue(&self) {
        let queued = self.queued_len();
        let batch_count = queued.div_ceil(self.batch_size);
        for _ in 0..batch_count {
            let events: Vec<Event> = match self.queue.lock() {
                Ok(mut queue) => {
                    let count = queue.len().min(self.batch_size);
                    queue.drain(..count).collect()
                }
                Err(_) => return,
            };
            if events.is_empty() {
                return;
            }
            self.send_batch(events);
        }
    }

    fn send_batch(&self, events: Vec<Event>) {
        let event_count = events.len();
        let request = LogEventRequest {
            events,
            statsig_metadata: self.metadata.clone(),
        };
        let result = catch_adapter_panic("event logging adapter log_events", || {
            self.adapter.log_events(&request)
        });
        match result {
            Ok(()) => {
                log::debug!(target: "switchyard", event_count; "flushed events");
            }
            Err(err) => {
                log::error!(target: "switchyard", event_count; "dropping event batch: {err}");
            }
        }
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use crate::{
        events::{Event, LogEventRequest},
        Result, SdkMetadata, User,
    };

    use super::EventLogger;

    fn recording_logger(
        max_queue_size: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> (Arc<EventLogger>, Arc<Mutex<Vec<LogEventRequest>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let adapter = {
            let batches = batches.clone();
            move |request: &LogEventRequest| -> Result<()> {
                batches.lock().unwrap().push(request.clone());
                Ok(())
            }
        };
        let logger = EventLogger::start(
            Arc::new(adapter),
            SdkMetadata::new(),
            max_queue_size,
            batch_size,
            flush_interval,
        )
        .unwrap();
        (logger, batches)
    }

    fn event(name: &str) -> Event {
        Event::custom(&User::with_user_id("u1"), name, None, None)
    }

    #[test]
    fn explicit_flush_delivers_batch() {
        let (logger, batches) = recording_logger(100, 100, Duration::from_secs(3600));
        logger.enqueue(event("a"));
        logger.enqueue(event("b"));
        logger.flush(Duration::from_secs(5)).unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 2);
        assert_eq!(logger.queued_len(), 0);
    }

    #[test]
    fn queue_never_exceeds_capacity() {
        let (logger, batches) = recording_logger(10, 10, Duration::from_secs(3600));
        for i in 0..1000 {
            logger.enqueue(event(&format!("e{i}")));
            assert!(logger.queued_len() <= 10);
        }
        logger.flush(Duration::from_secs(5)).unwrap();

        let delivered: usize = batches.lock().unwrap().iter().map(|b| b.events.len()).sum();
        assert_eq!(delivered as u64 + logger.dropped_events_count(), 1000);
    }

    #[test]
    fn interval_flush() {
        let (logger, batches) = recording_logger(100, 100, Duration::from_millis(10));
        logger.enqueue(event("a"));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while batches.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn shutdown_drains_and_is_idempotent() {
        let (logger, batches) = recording_logger(100, 100, Duration::from_secs(3600));
        logger.enqueue(event("a"));
        logger.shutdown(Duration::from_secs(5)).unwrap();
        logger.shutdown(Duration::from_secs(5)).unwrap();

        assert_eq!(batches.lock().unwrap().len(), 1);
        logger.enqueue(event("after"));
        assert_eq!(logger.queued_len(), 0);
    }

    #[test]
    fn failed_batches_are_dropped() {
        let adapter = |_: &LogEventRequest| -> Result<()> { Err(crate::Error::UnexpectedStatus(500)) };
        let logger =
            EventLogger::start(Arc::new(adapter), SdkMetadata::new(), 100, 100, Duration::from_secs(3600))
                .unwrap();
        logger.enqueue(event("a"));
        logger.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(logger.queued_len(), 0);
    }

    #[test]
    fn requests_carry_at_most_batch_size_events() {
        let (logger, batches) = recording_logger(1000, 10, Duration::from_secs(3600));
        for i in 0..25 {
            logger.enqueue(event(&format!("e{i}")));
        }
        logger.flush(Duration::from_secs(5)).unwrap();

        let batches = batches.lock().unwrap();
        assert!(batches.iter().all(|batch| batch.events.len() <= 10));
        let names: Vec<_> = batches
            .iter()
            .flat_map(|batch| batch.events.iter().map(|event| event.event_name.clone()))
            .collect();
        let expected: Vec<_> = (0..25).map(|i| format!("e{i}")).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn burst_below_capacity_is_flushed_without_drops() {
        let (logger, batches) = recording_logger(100, 10, Duration::from_secs(3600));
        for i in 0..99 {
            logger.enqueue(event(&format!("e{i}")));
        }

        // Full batches go out without an explicit flush.
        let delivered = || -> usize { batches.lock().unwrap().iter().map(|b| b.events.len()).sum() };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while delivered() < 90 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(delivered() >= 90);

        logger.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(delivered(), 99);
        assert_eq!(logger.dropped_events_count(), 0);
    }

    #[test]
    fn panicking_adapter_does_not_stop_flushing() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let adapter = {
            let calls = calls.clone();
            move |request: &LogEventRequest| -> Result<()> {
                let mut calls = calls.lock().unwrap();
                calls.push(request.events[0].event_name.clone());
                if calls.len() == 1 {
                    drop(calls);
                    panic!("adapter bug");
                }
                Ok(())
            }
        };
        let logger =
            EventLogger::start(Arc::new(adapter), SdkMetadata::new(), 100, 100, Duration::from_secs(3600))
                .unwrap();

        logger.enqueue(event("lost"));
        logger.flush(Duration::from_secs(5)).unwrap();
        logger.enqueue(event("delivered"));
        logger.flush(Duration::from_secs(5)).unwrap();

        assert_eq!(*calls.lock().unwrap(), ["lost", "delivered"]);
        assert_eq!(logger.queued_len(), 0);
        logger.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn exposures_are_deduplicated() {
        let (logger, batches) = recording_logger(100, 100, Duration::from_secs(3600));
        for _ in 0..3 {
            logger.enqueue_exposure(crate::events::Exposure {
                key: "gate|rule|u1".to_owned(),
                event: event("statsig::gate_exposure"),
            });
        }
        logger.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(batches.lock().unwrap()[0].events.len(), 1);
    }
}

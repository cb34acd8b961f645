use crate::{CommError, Status};
use gvon_types::{Tag, VAddr};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

pub(crate) struct Completion {
    pub status: Status,
    pub bytes: Option<Vec<u8>>,
}

pub(crate) type EventResult = Result<Completion, CommError>;

/// Completion cell for operations serviced by background tasks.
pub(crate) struct SharedEvent {
    state: Mutex<Option<EventResult>>,
    cond: Condvar,
}

impl SharedEvent {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, result: EventResult) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(result);
            self.cond.notify_all();
        }
    }

    fn take_blocking(&self) -> EventResult {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.take() {
                return result;
            }
            self.cond.wait(&mut state);
        }
    }

    fn try_take(&self) -> Option<EventResult> {
        self.state.lock().take()
    }
}

/// Operation that is carried out lazily by the waiting thread itself, used
/// by backends without background completion.
pub(crate) trait DeferredOp: Send {
    /// Attempt completion without blocking.
    fn try_complete(&mut self) -> Result<Option<Completion>, CommError>;
    /// Block until the operation completes.
    fn complete(&mut self) -> EventResult;
}

enum EventKind {
    Settled,
    Shared(Arc<SharedEvent>),
    Deferred(Box<dyn DeferredOp>),
}

/// Handle of an in-flight non-blocking operation.
///
/// The event moves from in-flight to complete through [`Event::wait`] or a
/// successful [`Event::ready`] probe; afterwards [`Event::source`] and
/// [`Event::tag`] are stable and a received payload can be taken once. The
/// optional completion callback fires exactly once, regardless of how
/// completion was observed.
pub struct Event {
    kind: EventKind,
    done: Option<EventResult>,
    on_ready: Option<Box<dyn FnOnce() + Send>>,
}

impl Event {
    pub(crate) fn immediate(status: Status, bytes: Option<Vec<u8>>) -> Self {
        Self {
            kind: EventKind::Settled,
            done: Some(Ok(Completion { status, bytes })),
            on_ready: None,
        }
    }

    pub(crate) fn shared(shared: Arc<SharedEvent>) -> Self {
        Self {
            kind: EventKind::Shared(shared),
            done: None,
            on_ready: None,
        }
    }

    pub(crate) fn deferred(op: Box<dyn DeferredOp>) -> Self {
        Self {
            kind: EventKind::Deferred(op),
            done: None,
            on_ready: None,
        }
    }

    /// Attach a completion callback. It is invoked exactly once, from the
    /// thread that first observes completion.
    pub fn with_callback(mut self, on_ready: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(on_ready));
        self
    }

    /// Block until the operation has completed.
    pub fn wait(&mut self) -> Result<Status, CommError> {
        self.finish(true);
        match &self.done {
            Some(Ok(completion)) => Ok(completion.status),
            Some(Err(err)) => Err(err.clone()),
            None => Err(CommError::Protocol(
                "event has no pending operation".into(),
            )),
        }
    }

    /// Non-blocking completion probe.
    pub fn ready(&mut self) -> bool {
        self.finish(false);
        self.done.is_some()
    }

    /// Source peer of the completed operation.
    pub fn source(&self) -> Option<VAddr> {
        match &self.done {
            Some(Ok(completion)) => Some(completion.status.source),
            _ => None,
        }
    }

    /// Tag of the completed operation.
    pub fn tag(&self) -> Option<Tag> {
        match &self.done {
            Some(Ok(completion)) => Some(completion.status.tag),
            _ => None,
        }
    }

    /// Payload of a completed receive. Yields the bytes once.
    pub fn take_bytes(&mut self) -> Option<Vec<u8>> {
        match &mut self.done {
            Some(Ok(completion)) => completion.bytes.take(),
            _ => None,
        }
    }

    fn finish(&mut self, block: bool) {
        if self.done.is_none() {
            let result = match &mut self.kind {
                EventKind::Settled => None,
                EventKind::Shared(shared) => {
                    if block {
                        Some(shared.take_blocking())
                    } else {
                        shared.try_take()
                    }
                }
                EventKind::Deferred(op) => {
                    if block {
                        Some(op.complete())
                    } else {
                        match op.try_complete() {
                            Ok(Some(completion)) => Some(Ok(completion)),
                            Ok(None) => None,
                            Err(err) => Some(Err(err)),
                        }
                    }
                }
            };
            if let Some(result) = result {
                self.kind = EventKind::Settled;
                self.done = Some(result);
            }
        }
        if self.done.is_some() {
            if let Some(on_ready) = self.on_ready.take() {
                on_ready();
            }
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // Dropping an unwaited event is a programmer error; probe once so a
        // finished operation still runs its callback.
        if self.done.is_none() {
            self.finish(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status() -> Status {
        Status {
            source: VAddr(1),
            tag: Tag(5),
            size: 3,
        }
    }

    #[test]
    fn immediate_event_is_ready_and_stable() {
        let mut event = Event::immediate(status(), Some(vec![1, 2, 3]));
        assert!(event.ready());
        assert_eq!(event.wait().expect("event should complete"), status());
        assert_eq!(event.source(), Some(VAddr(1)));
        assert_eq!(event.tag(), Some(Tag(5)));
        assert_eq!(event.take_bytes(), Some(vec![1, 2, 3]));
        assert_eq!(event.take_bytes(), None);
    }

    #[test]
    fn shared_event_completes_from_another_thread() {
        let shared = SharedEvent::new();
        let mut event = Event::shared(shared.clone());
        assert!(!event.ready());

        let completer = shared.clone();
        let handle = std::thread::spawn(move || {
            completer.complete(Ok(Completion {
                status: Status {
                    source: VAddr(0),
                    tag: Tag(0),
                    size: 0,
                },
                bytes: None,
            }));
        });
        let waited = event.wait().expect("event should complete");
        assert_eq!(waited.source, VAddr(0));
        handle.join().expect("completer thread should finish");
    }

    #[test]
    fn callback_fires_exactly_once_across_ready_and_wait() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let mut event = Event::immediate(status(), None)
            .with_callback(|| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            });
        assert!(event.ready());
        event.wait().expect("event should complete");
        assert!(event.ready());
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_event_reports_error_on_wait() {
        let shared = SharedEvent::new();
        shared.complete(Err(CommError::Transport("peer gone".into())));
        let mut event = Event::shared(shared);
        let err = event.wait().expect_err("event should report the failure");
        assert!(matches!(err, CommError::Transport(_)));
    }
}

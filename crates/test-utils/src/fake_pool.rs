//! Fake worker pool for tests.
//!
//! - records every reservation, release and submitted command
//! - plays back scripted process output per command
//! - can hang or fail the execution stream to exercise cancellation and
//!   fault paths

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use gridexec::errors::{EngineError, Result};
use gridexec::pool::{
    CorePreference, CoreReservation, ExecuteRequest, ProcessEvent, WorkerPool,
};

/// Scripted behaviour of one executed command.
#[derive(Debug, Clone, Default)]
pub struct CoreScript {
    pub events: Vec<ProcessEvent>,
    /// After the scripted events, never deliver anything more; the unit
    /// must observe cancellation instead.
    pub hang_after_events: bool,
    /// After the scripted events, fail the stream with a transport error.
    pub fail_transport: bool,
}

impl CoreScript {
    /// Print one line, then exit with `code`.
    pub fn exit(code: i32) -> Self {
        Self {
            events: vec![
                ProcessEvent::StdoutLine("done".to_string()),
                ProcessEvent::Exited(code),
            ],
            ..Self::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang_after_events: true,
            ..Self::default()
        }
    }

    pub fn transport_fault() -> Self {
        Self {
            fail_transport: true,
            ..Self::default()
        }
    }
}

struct PoolInner {
    has_local: bool,
    has_remote: bool,
    scripts: Mutex<HashMap<String, CoreScript>>,
    reservations: AtomicUsize,
    releases: AtomicUsize,
    executed: Mutex<Vec<String>>,
    next_core: AtomicU32,
}

/// A fake pool with unlimited local and/or remote cores.
pub struct FakeWorkerPool {
    inner: Arc<PoolInner>,
}

impl FakeWorkerPool {
    pub fn local_only() -> Self {
        Self::new(true, false)
    }

    pub fn with_remote() -> Self {
        Self::new(true, true)
    }

    fn new(has_local: bool, has_remote: bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                has_local,
                has_remote,
                scripts: Mutex::new(HashMap::new()),
                reservations: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                executed: Mutex::new(Vec::new()),
                next_core: AtomicU32::new(1),
            }),
        }
    }

    /// Script the run of the given command (commands default to
    /// `CoreScript::exit(0)`).
    pub fn script(&self, command: &str, script: CoreScript) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), script);
    }

    pub fn reservation_count(&self) -> usize {
        self.inner.reservations.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// Commands submitted for execution, in submission order.
    pub fn executed(&self) -> Vec<String> {
        self.inner.executed.lock().unwrap().clone()
    }
}

impl WorkerPool for FakeWorkerPool {
    fn reserve_core<'a>(
        &'a self,
        preference: CorePreference,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn CoreReservation>>> + Send + 'a>> {
        let inner = self.inner.clone();

        Box::pin(async move {
            let remote = match preference {
                CorePreference::RequireLocal => {
                    if !inner.has_local {
                        // No local core will ever come; block like a real
                        // pool would until the caller gives up.
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                            _ = std::future::pending::<()>() => unreachable!(),
                        }
                    }
                    false
                }
                CorePreference::PreferRemote => inner.has_remote,
            };

            inner.reservations.fetch_add(1, Ordering::SeqCst);
            let number = inner.next_core.fetch_add(1, Ordering::SeqCst);
            let machine = if remote { "remote-worker" } else { "localhost" };

            Ok(Box::new(FakeCore {
                inner,
                machine: machine.to_string(),
                number,
                remote,
                queue: VecDeque::new(),
                hang: false,
                fail_transport: false,
            }) as Box<dyn CoreReservation>)
        })
    }
}

struct FakeCore {
    inner: Arc<PoolInner>,
    machine: String,
    number: u32,
    remote: bool,
    queue: VecDeque<ProcessEvent>,
    hang: bool,
    fail_transport: bool,
}

impl CoreReservation for FakeCore {
    fn machine_name(&self) -> &str {
        &self.machine
    }

    fn core_number(&self) -> u32 {
        self.number
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn submit<'a>(
        &'a mut self,
        request: ExecuteRequest,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let command = request.descriptor.process().command.clone();
            self.inner.executed.lock().unwrap().push(command.clone());

            let script = self
                .inner
                .scripts
                .lock()
                .unwrap()
                .get(&command)
                .cloned()
                .unwrap_or_else(|| CoreScript::exit(0));

            self.queue = script.events.into();
            self.hang = script.hang_after_events;
            self.fail_transport = script.fail_transport;
            Ok(())
        })
    }

    fn next_event<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProcessEvent>>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            if self.fail_transport {
                return Err(EngineError::Transport(
                    "fake worker connection lost".to_string(),
                ));
            }
            if self.hang {
                cancel.cancelled().await;
                return Err(EngineError::Cancelled);
            }
            Ok(None)
        })
    }

    fn release(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.releases.fetch_add(1, Ordering::SeqCst);
        })
    }
}

//! Recording stub connection for test suites.
//!
//! Every call that reaches a [`StubConnection`] is appended to the shared
//! [`StubProbe`] log, so assertions can be made after the connection has been
//! moved into a proxy. Failures can be switched on per operation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

use crate::connection::{Connection, Credentials, Driver};

/// A call that reached the stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetAutoCommit(bool),
    Commit,
    Rollback,
    Close,
    Execute(String),
    Query(String),
}

#[derive(Debug, Error)]
#[error("stub {0} failed")]
pub struct StubError(pub &'static str);

#[derive(Default)]
struct ProbeInner {
    calls: Mutex<Vec<Call>>,
    fail_rollback: AtomicBool,
    fail_execute: AtomicBool,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
}

/// Shared call log and failure switches
#[derive(Clone, Default)]
pub struct StubProbe {
    inner: Arc<ProbeInner>,
}

impl StubProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.inner.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn clear(&self) {
        self.inner.calls.lock().clear();
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.inner.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn fail_execute(&self, fail: bool) {
        self.inner.fail_execute.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Number of connections opened through a [`StubDriver`]
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.inner.calls.lock().push(call);
    }
}

pub struct StubConnection {
    probe: StubProbe,
    auto_commit: bool,
}

impl StubConnection {
    pub fn new(probe: &StubProbe) -> Self {
        Self {
            probe: probe.clone(),
            auto_commit: true,
        }
    }
}

impl Connection for StubConnection {
    type Error = StubError;

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), StubError> {
        self.probe.record(Call::SetAutoCommit(auto_commit));
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> Result<bool, StubError> {
        Ok(self.auto_commit)
    }

    fn commit(&mut self) -> Result<(), StubError> {
        self.probe.record(Call::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StubError> {
        self.probe.record(Call::Rollback);
        if self.probe.inner.fail_rollback.load(Ordering::SeqCst) {
            return Err(StubError("rollback"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), StubError> {
        self.probe.record(Call::Close);
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<usize, StubError> {
        self.probe.record(Call::Execute(sql.to_string()));
        if self.probe.inner.fail_execute.load(Ordering::SeqCst) {
            return Err(StubError("execute"));
        }
        Ok(0)
    }

    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, StubError> {
        self.probe.record(Call::Query(sql.to_string()));
        Ok(None)
    }
}

/// Driver handing out [`StubConnection`]s that share one probe
#[derive(Clone, Default)]
pub struct StubDriver {
    probe: StubProbe,
}

impl StubDriver {
    pub fn new(probe: &StubProbe) -> Self {
        Self {
            probe: probe.clone(),
        }
    }
}

impl Driver for StubDriver {
    type Connection = StubConnection;

    fn connect(&self, _dsn: &str, _credentials: &Credentials) -> Result<StubConnection, StubError> {
        if self.probe.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(StubError("connect"));
        }
        self.probe.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(StubConnection::new(&self.probe))
    }
}

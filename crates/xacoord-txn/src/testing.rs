//! Scripted XA resources and factories for tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use xacoord_common::types::Xid;

use crate::factory::{DestroyError, FactoryError, XaResourceFactory};
use crate::fatal::FatalErrorHandler;
use crate::xa::{CommitMode, EndFlag, StartFlag, Vote, XaError, XaErrorCode, XaResource, XaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    End,
    Prepare,
    Commit,
    CommitOnePhase,
    Rollback,
    Forget,
    Recover,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub resource: String,
    pub op: Op,
    pub xid: Option<Xid>,
}

/// Calls made on any number of scripted resources, in order
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<Call>>,
}

impl CallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, resource: &str, op: Op, xid: Option<&Xid>) {
        self.calls.lock().push(Call {
            resource: resource.to_string(),
            op,
            xid: xid.cloned(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn ops(&self) -> Vec<(String, Op)> {
        self.calls
            .lock()
            .iter()
            .map(|c| (c.resource.clone(), c.op))
            .collect()
    }

    pub fn ops_for(&self, resource: &str) -> Vec<Op> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.resource == resource)
            .map(|c| c.op)
            .collect()
    }

    pub fn count(&self, resource: &str, op: Op) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.resource == resource && c.op == op)
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// An in-process resource manager whose failures are queued per operation
///
/// Prepared branches are kept in doubt until committed or rolled back and are
/// reported by `recover`. A two-phase commit of a branch it does not know
/// fails with `XAER_NOTA`.
pub struct ScriptedResource {
    name: String,
    calls: Arc<CallLog>,
    failures: Mutex<HashMap<Op, VecDeque<XaErrorCode>>>,
    read_only: AtomicBool,
    one_phase: AtomicBool,
    hang_on_commit: AtomicBool,
    mode: CommitMode,
    in_doubt: Mutex<Vec<Xid>>,
    timeout_secs: AtomicU64,
}

impl ScriptedResource {
    pub fn new(name: &str, calls: &Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self::build(name, calls, CommitMode::TwoPhase))
    }

    /// A resource that can only commit in one phase (last participant)
    pub fn one_phase_only(name: &str, calls: &Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self::build(name, calls, CommitMode::OnePhaseOnly))
    }

    fn build(name: &str, calls: &Arc<CallLog>, mode: CommitMode) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::clone(calls),
            failures: Mutex::new(HashMap::new()),
            read_only: AtomicBool::new(false),
            one_phase: AtomicBool::new(true),
            hang_on_commit: AtomicBool::new(false),
            mode,
            in_doubt: Mutex::new(Vec::new()),
            timeout_secs: AtomicU64::new(0),
        }
    }

    /// Fail the next call of `op` with `code`
    pub fn fail_next(&self, op: Op, code: XaErrorCode) {
        self.failures.lock().entry(op).or_default().push_back(code);
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn set_supports_one_phase(&self, supported: bool) {
        self.one_phase.store(supported, Ordering::SeqCst);
    }

    /// Never return from a two-phase commit, simulating a crash mid-phase 2
    pub fn set_hang_on_commit(&self, hang: bool) {
        self.hang_on_commit.store(hang, Ordering::SeqCst);
    }

    pub fn in_doubt(&self) -> Vec<Xid> {
        self.in_doubt.lock().clone()
    }

    /// Pretend a branch was prepared, e.g. before a crash
    pub fn add_in_doubt(&self, xid: Xid) {
        self.in_doubt.lock().push(xid);
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.load(Ordering::SeqCst)
    }

    fn call(&self, op: Op, xid: Option<&Xid>) -> XaResult<()> {
        self.calls.record(&self.name, op, xid);
        match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(code) => Err(XaError::new(code, format!("scripted failure in {}", self.name))),
            None => Ok(()),
        }
    }

    fn resolve(&self, xid: &Xid) -> bool {
        let mut in_doubt = self.in_doubt.lock();
        let before = in_doubt.len();
        in_doubt.retain(|x| x != xid);
        in_doubt.len() != before
    }
}

#[async_trait]
impl XaResource for ScriptedResource {
    fn resource_name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self, xid: &Xid, _flag: StartFlag) -> XaResult<()> {
        self.call(Op::Start, Some(xid))
    }

    async fn end(&self, xid: &Xid, _flag: EndFlag) -> XaResult<()> {
        self.call(Op::End, Some(xid))
    }

    async fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        self.call(Op::Prepare, Some(xid))?;
        if self.read_only.load(Ordering::SeqCst) {
            return Ok(Vote::ReadOnly);
        }
        self.in_doubt.lock().push(xid.clone());
        Ok(Vote::Ok)
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        let op = if one_phase { Op::CommitOnePhase } else { Op::Commit };
        self.call(op, Some(xid))?;
        if one_phase {
            return Ok(());
        }
        if self.hang_on_commit.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.resolve(xid) {
            Ok(())
        } else {
            Err(XaErrorCode::NotA.into())
        }
    }

    async fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.call(Op::Rollback, Some(xid))?;
        self.resolve(xid);
        Ok(())
    }

    async fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.call(Op::Forget, Some(xid))
    }

    async fn recover(&self) -> XaResult<Vec<Xid>> {
        self.call(Op::Recover, None)?;
        Ok(self.in_doubt())
    }

    async fn set_transaction_timeout(&self, secs: u64) -> XaResult<bool> {
        self.timeout_secs.store(secs, Ordering::SeqCst);
        Ok(true)
    }

    fn supports_one_phase(&self) -> bool {
        self.one_phase.load(Ordering::SeqCst)
    }

    fn commit_mode(&self) -> CommitMode {
        self.mode
    }
}

/// Factory handing out scripted resources by registration info
#[derive(Default)]
pub struct ScriptedFactory {
    resources: Mutex<HashMap<Vec<u8>, Arc<ScriptedResource>>>,
    unavailable: AtomicU32,
    broken: AtomicBool,
    created: AtomicU32,
    destroyed: AtomicU32,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, info: &[u8], resource: Arc<ScriptedResource>) {
        self.resources.lock().insert(info.to_vec(), resource);
    }

    /// Report the resource manager as unavailable for the next `n` requests
    pub fn set_unavailable(&self, n: u32) {
        self.unavailable.store(n, Ordering::SeqCst);
    }

    /// Fail every request with a non-transient error
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> u32 {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl XaResourceFactory for ScriptedFactory {
    async fn get_xa_resource(&self, info: &[u8]) -> Result<Arc<dyn XaResource>, FactoryError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(FactoryError::Other("factory is broken".to_string()));
        }
        let unavailable = self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if unavailable {
            return Err(FactoryError::NotAvailable("resource manager down".to_string()));
        }

        let resource = self
            .resources
            .lock()
            .get(info)
            .cloned()
            .ok_or_else(|| FactoryError::NotAvailable("unknown resource info".to_string()))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(resource)
    }

    async fn destroy_xa_resource(&self, _resource: Arc<dyn XaResource>) -> Result<(), DestroyError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fatal handler that records messages instead of aborting
#[derive(Default)]
pub struct RecordingFatalHandler {
    messages: Mutex<Vec<String>>,
}

impl RecordingFatalHandler {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl FatalErrorHandler for RecordingFatalHandler {
    fn on_fatal(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

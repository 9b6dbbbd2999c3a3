//! Per-transaction table of enlisted resources

use std::sync::Arc;

use xacoord_common::types::{Priority, RecoveryId, ResourceStatus, Xid};
use xacoord_log::BranchRecord;

use crate::xa::{CommitMode, XaResource};

/// Association of a branch with its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Active,
    Suspended,
    Ended,
    /// Delisted with FAIL or `end` failed; the branch only gets rolled back
    Failed,
}

/// One resource's participation in a transaction
pub struct Enlistment {
    pub resource: Arc<dyn XaResource>,
    pub name: String,
    pub xid: Xid,
    pub recovery_id: Option<RecoveryId>,
    pub priority: Priority,
    /// Enlistment order, breaks priority ties
    pub seq: u32,
    pub state: BranchState,
    pub status: ResourceStatus,
    /// Ask the factory for a fresh handle before the next completion call
    pub needs_reconnect: bool,
    /// Completion calls made so far
    pub attempts: u32,
    /// Rebuilt from the log after a restart
    pub recovered: bool,
    pub one_phase_only: bool,
    /// Handle came from a factory and is destroyed once the branch is done
    pub reconstructed_from: Option<String>,
}

impl Enlistment {
    pub fn is_resource(&self, resource: &Arc<dyn XaResource>) -> bool {
        same_resource(&self.resource, resource)
    }

    pub fn to_record(&self) -> BranchRecord {
        BranchRecord {
            recovery_id: self.recovery_id,
            priority: self.priority,
            bqual: self.xid.bqual().to_vec(),
            resource_name: self.name.clone(),
            status: self.status,
        }
    }
}

/// Identity of two handles, ignoring vtables
pub fn same_resource(a: &Arc<dyn XaResource>, b: &Arc<dyn XaResource>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// Sort `(priority, seq)` pairs into completion order: priority descending,
/// then enlistment order
pub fn completion_order(keys: &[(Priority, u32)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| {
        let (pa, sa) = keys[a];
        let (pb, sb) = keys[b];
        pb.cmp(&pa).then(sa.cmp(&sb))
    });
    order
}

/// Resources enlisted in one transaction
#[derive(Default)]
pub struct EnlistmentTable {
    entries: Vec<Enlistment>,
    next_seq: u32,
}

impl EnlistmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Enlistment] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [Enlistment] {
        &mut self.entries
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Enlistment {
        &mut self.entries[index]
    }

    pub fn find(&self, resource: &Arc<dyn XaResource>) -> Option<usize> {
        self.entries.iter().position(|e| e.is_resource(resource))
    }

    /// Enlist a fresh branch of `global`, qualified by its enlistment number
    pub fn add(
        &mut self,
        resource: Arc<dyn XaResource>,
        global: &Xid,
        recovery_id: Option<RecoveryId>,
        priority: Priority,
    ) -> usize {
        self.next_seq += 1;
        let seq = self.next_seq;
        let one_phase_only = resource.commit_mode() == CommitMode::OnePhaseOnly;
        self.entries.push(Enlistment {
            name: resource.resource_name(),
            resource,
            xid: global.branch(seq),
            recovery_id,
            priority,
            seq,
            state: BranchState::Active,
            status: ResourceStatus::Registered,
            needs_reconnect: false,
            attempts: 0,
            recovered: false,
            one_phase_only,
            reconstructed_from: None,
        });
        self.entries.len() - 1
    }

    /// Drop the most recent enlistment (its `start` failed)
    pub fn pop(&mut self) -> Option<Enlistment> {
        self.entries.pop()
    }

    /// Rebuild a branch from a logged record with a reconstructed handle
    pub fn add_recovered(
        &mut self,
        resource: Arc<dyn XaResource>,
        factory: String,
        xid: Xid,
        branch: &BranchRecord,
    ) {
        self.next_seq += 1;
        self.entries.push(Enlistment {
            name: branch.resource_name.clone(),
            resource,
            xid,
            recovery_id: branch.recovery_id,
            priority: branch.priority,
            seq: self.next_seq,
            state: BranchState::Ended,
            status: branch.status,
            needs_reconnect: false,
            attempts: 0,
            recovered: true,
            one_phase_only: false,
            reconstructed_from: Some(factory),
        });
    }

    /// Indices in prepare/commit order
    pub fn completion_order(&self) -> Vec<usize> {
        let keys: Vec<_> = self.entries.iter().map(|e| (e.priority, e.seq)).collect();
        completion_order(&keys)
    }

    pub fn one_phase_only(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.one_phase_only)
    }

    pub fn has_two_phase(&self) -> bool {
        self.entries.iter().any(|e| !e.one_phase_only)
    }

    /// Branch records in completion order
    pub fn to_records(&self) -> Vec<BranchRecord> {
        self.completion_order()
            .into_iter()
            .map(|i| self.entries[i].to_record())
            .collect()
    }

    /// Take the handles that came from factories, with their factory names
    pub fn take_reconstructed(&mut self) -> Vec<(String, Arc<dyn XaResource>)> {
        self.entries
            .iter_mut()
            .filter_map(|e| {
                e.reconstructed_from
                    .take()
                    .map(|factory| (factory, Arc::clone(&e.resource)))
            })
            .collect()
    }
}

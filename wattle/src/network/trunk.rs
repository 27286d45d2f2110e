// Wattle: Hierarchical Data-Plane Service Broker
// Copyright (C) 2022  The Wattle Developers
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! # Trunk
//!
//! A trunk is an operator-declared bidirectional edge between two terminals
//! of two inferior networks of an aggregator. It carries labelled
//! sub-channels out of an operator-provided label range, and two bandwidth
//! budgets (one per direction of the trunk's fixed reference orientation).
//!
//! Each side of the trunk has its own local label space. Allocation is
//! deterministic: the lowest free label on side A, then the same numeral on
//! side B if it is free there, else the lowest free label on side B. This
//! keeps the two sides aligned in the common case, which makes operator
//! debugging easier.
//!
//! All trunk state is owned by the enclosing aggregator and mutated under
//! its lock; the public [`Trunk`] handle locks the aggregator on every
//! operation.

use crate::network::aggregator::{AggShared, AggregatorError};
use crate::network::service::ServiceId;
use crate::network::{Bandwidth, Label};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Weak;
use thiserror::Error as ThisError;

/// The highest label value usable on a trunk sub-channel.
pub const MAX_LABEL: Label = 4094;

/// Aggregator-scoped trunk identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrunkId(pub(crate) u64);

impl fmt::Display for TrunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trunk{}", self.0)
    }
}

/// One end of a trunk: an inferior network and one of its terminals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrunkEnd {
    /// Name of the inferior network owning the terminal.
    pub network: String,
    /// Local name of the terminal within the inferior network.
    pub terminal: String,
}

impl TrunkEnd {
    /// Create a trunk end.
    pub fn of<N: Into<String>, T: Into<String>>(network: N, terminal: T) -> Self {
        Self {
            network: network.into(),
            terminal: terminal.into(),
        }
    }
}

impl fmt::Display for TrunkEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.terminal)
    }
}

/// Trunk resource errors
#[derive(Debug, ThisError, PartialEq)]
pub enum TrunkError {
    /// No free label pair is available on the trunk.
    #[error("no free labels on {0}")]
    OutOfLabels(TrunkId),
    /// The trunk's remaining bandwidth cannot satisfy the request.
    #[error("insufficient bandwidth on {0}: requested {1}")]
    OutOfBandwidth(TrunkId, Bandwidth),
    /// Labels cannot be revoked while allocated to a service.
    #[error("labels {1:?} on {0} are allocated")]
    LabelsInUse(TrunkId, Vec<Label>),
    /// The trunk (or its owning aggregator) no longer exists.
    #[error("{0} no longer exists")]
    Gone(TrunkId),
}

/// A label pair reserved on a trunk for one service, with the bandwidth it
/// holds in each direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TrunkAllocation {
    pub(crate) label_b: Label,
    pub(crate) up: Bandwidth,
    pub(crate) down: Bandwidth,
    pub(crate) service: ServiceId,
}

/// The state of a trunk. Owned by the aggregator; every mutation happens
/// under the aggregator lock.
pub(crate) struct TrunkState {
    pub(crate) id: TrunkId,
    pub(crate) end_a: TrunkEnd,
    pub(crate) end_b: TrunkEnd,
    pub(crate) delay: f64,
    capacity_up: Bandwidth,
    capacity_down: Bandwidth,
    avail_up: Bandwidth,
    avail_down: Bandwidth,
    declared: BTreeSet<Label>,
    free_a: BTreeSet<Label>,
    free_b: BTreeSet<Label>,
    allocations: BTreeMap<Label, TrunkAllocation>,
}

impl TrunkState {
    pub(crate) fn new(id: TrunkId, end_a: TrunkEnd, end_b: TrunkEnd) -> Self {
        Self {
            id,
            end_a,
            end_b,
            delay: 0.0,
            capacity_up: 0.0,
            capacity_down: 0.0,
            avail_up: 0.0,
            avail_down: 0.0,
            declared: BTreeSet::new(),
            free_a: BTreeSet::new(),
            free_b: BTreeSet::new(),
            allocations: BTreeMap::new(),
        }
    }

    pub(crate) fn set_delay(&mut self, delay: f64) {
        self.delay = delay.max(0.0);
    }

    /// Change the trunk's bandwidth budgets. Shrinking below the bandwidth
    /// currently allocated would overbook the trunk and is refused.
    pub(crate) fn set_capacity(
        &mut self,
        up: Bandwidth,
        down: Bandwidth,
    ) -> Result<(), TrunkError> {
        let held_up = self.capacity_up - self.avail_up;
        let held_down = self.capacity_down - self.avail_down;
        if up < held_up || down < held_down {
            return Err(TrunkError::OutOfBandwidth(self.id, up.min(down)));
        }
        self.capacity_up = up;
        self.capacity_down = down;
        self.avail_up = up - held_up;
        self.avail_down = down - held_down;
        Ok(())
    }

    /// Add labels to the operator-declared range. Labels outside `1..=4094`
    /// and labels already declared are ignored.
    pub(crate) fn provide_labels<I: IntoIterator<Item = Label>>(&mut self, labels: I) {
        for label in labels {
            if label == 0 || label > MAX_LABEL {
                continue;
            }
            if self.declared.insert(label) {
                self.free_a.insert(label);
                self.free_b.insert(label);
            }
        }
    }

    /// Remove labels from the declared range. Only labels currently free on
    /// both sides may be removed.
    pub(crate) fn revoke_labels<I: IntoIterator<Item = Label>>(
        &mut self,
        labels: I,
    ) -> Result<(), TrunkError> {
        let wanted: Vec<Label> = labels.into_iter().filter(|l| self.declared.contains(l)).collect();
        let blocked: Vec<Label> = wanted
            .iter()
            .copied()
            .filter(|l| !self.free_a.contains(l) || !self.free_b.contains(l))
            .collect();
        if !blocked.is_empty() {
            return Err(TrunkError::LabelsInUse(self.id, blocked));
        }
        for label in wanted {
            self.declared.remove(&label);
            self.free_a.remove(&label);
            self.free_b.remove(&label);
        }
        Ok(())
    }

    /// Reserve one label pair and the given bandwidth for a service.
    pub(crate) fn allocate(
        &mut self,
        up: Bandwidth,
        down: Bandwidth,
        service: ServiceId,
    ) -> Result<(Label, Label), TrunkError> {
        if self.avail_up < up || self.avail_down < down {
            return Err(TrunkError::OutOfBandwidth(self.id, up.max(down)));
        }
        let label_a = match self.free_a.iter().next() {
            Some(l) => *l,
            None => return Err(TrunkError::OutOfLabels(self.id)),
        };
        let label_b = if self.free_b.contains(&label_a) {
            label_a
        } else {
            match self.free_b.iter().next() {
                Some(l) => *l,
                None => return Err(TrunkError::OutOfLabels(self.id)),
            }
        };
        self.free_a.remove(&label_a);
        self.free_b.remove(&label_b);
        self.avail_up -= up;
        self.avail_down -= down;
        self.allocations.insert(
            label_a,
            TrunkAllocation {
                label_b,
                up,
                down,
                service,
            },
        );
        Ok((label_a, label_b))
    }

    /// Return an allocation, identified by its side-A label, to the free
    /// pools. Unknown labels are a no-op, making release idempotent.
    pub(crate) fn release(&mut self, label_a: Label) -> Option<TrunkAllocation> {
        let allocation = self.allocations.remove(&label_a)?;
        self.free_a.insert(label_a);
        self.free_b.insert(allocation.label_b);
        self.avail_up += allocation.up;
        self.avail_down += allocation.down;
        Some(allocation)
    }

    /// Re-impose a persisted allocation, removing its labels from the free
    /// pools and its bandwidth from the budgets.
    pub(crate) fn restore_allocation(
        &mut self,
        label_a: Label,
        allocation: TrunkAllocation,
    ) -> Result<(), TrunkError> {
        if !self.free_a.contains(&label_a) || !self.free_b.contains(&allocation.label_b) {
            return Err(TrunkError::LabelsInUse(self.id, vec![label_a]));
        }
        if self.avail_up < allocation.up || self.avail_down < allocation.down {
            return Err(TrunkError::OutOfBandwidth(self.id, allocation.up));
        }
        self.free_a.remove(&label_a);
        self.free_b.remove(&allocation.label_b);
        self.avail_up -= allocation.up;
        self.avail_down -= allocation.down;
        self.allocations.insert(label_a, allocation);
        Ok(())
    }

    pub(crate) fn in_use(&self) -> bool {
        !self.allocations.is_empty()
    }

    pub(crate) fn remaining(&self) -> (Bandwidth, Bandwidth) {
        (self.avail_up, self.avail_down)
    }

    pub(crate) fn capacity(&self) -> (Bandwidth, Bandwidth) {
        (self.capacity_up, self.capacity_down)
    }

    pub(crate) fn declared_labels(&self) -> &BTreeSet<Label> {
        &self.declared
    }

    pub(crate) fn free_labels_a(&self) -> &BTreeSet<Label> {
        &self.free_a
    }

    pub(crate) fn free_labels_b(&self) -> &BTreeSet<Label> {
        &self.free_b
    }

    pub(crate) fn allocations(&self) -> &BTreeMap<Label, TrunkAllocation> {
        &self.allocations
    }

    /// Whether the given network/terminal pair is one of the trunk's ends.
    pub(crate) fn has_terminal(&self, network: &str, terminal: &str) -> bool {
        (self.end_a.network == network && self.end_a.terminal == terminal)
            || (self.end_b.network == network && self.end_b.terminal == terminal)
    }

    /// A trunk whose both ends sit in the same inferior network never enters
    /// the planning graph; the inferior resolves such connectivity locally.
    pub(crate) fn is_loop(&self) -> bool {
        self.end_a.network == self.end_b.network
    }
}

/// Management handle on a trunk. Every operation locks the owning
/// aggregator; the handle stays valid for the trunk's lifetime and reports
/// [`TrunkError::Gone`] afterwards.
#[derive(Clone)]
pub struct Trunk {
    pub(crate) agg: Weak<AggShared>,
    pub(crate) id: TrunkId,
}

impl fmt::Debug for Trunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trunk").field("id", &self.id).finish()
    }
}

impl PartialEq for Trunk {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Trunk {
    fn with<R>(
        &self,
        f: impl FnOnce(&mut TrunkState) -> Result<R, TrunkError>,
    ) -> Result<R, TrunkError> {
        let shared = self.agg.upgrade().ok_or(TrunkError::Gone(self.id))?;
        let mut inner = shared.inner.lock().unwrap();
        let state = inner.trunks.get_mut(&self.id).ok_or(TrunkError::Gone(self.id))?;
        f(state)
    }

    /// The aggregator-scoped id of the trunk.
    pub fn id(&self) -> TrunkId {
        self.id
    }

    /// The trunk's two ends, in reference orientation.
    pub fn ends(&self) -> Result<(TrunkEnd, TrunkEnd), TrunkError> {
        self.with(|t| Ok((t.end_a.clone(), t.end_b.clone())))
    }

    /// Set the trunk's delay metric. Negative values are clamped to zero.
    pub fn set_delay(&self, delay: f64) -> Result<(), TrunkError> {
        self.with(|t| {
            t.set_delay(delay);
            Ok(())
        })
    }

    /// The trunk's delay metric.
    pub fn delay(&self) -> Result<f64, TrunkError> {
        self.with(|t| Ok(t.delay))
    }

    /// Set the trunk's bandwidth budgets (upstream, downstream with respect
    /// to the reference orientation). Refused if it would shrink a budget
    /// below what is currently allocated.
    pub fn set_bandwidth(&self, up: Bandwidth, down: Bandwidth) -> Result<(), TrunkError> {
        self.with(|t| t.set_capacity(up, down))
    }

    /// The trunk's remaining bandwidth in each direction.
    pub fn remaining_bandwidth(&self) -> Result<(Bandwidth, Bandwidth), TrunkError> {
        self.with(|t| Ok(t.remaining()))
    }

    /// Make a range of labels available on the trunk.
    pub fn provide_labels<I: IntoIterator<Item = Label>>(&self, labels: I) -> Result<(), TrunkError> {
        self.with(|t| {
            t.provide_labels(labels);
            Ok(())
        })
    }

    /// Withdraw labels from the trunk. Only labels currently in the free
    /// pool of both sides may be withdrawn.
    pub fn revoke_labels<I: IntoIterator<Item = Label>>(&self, labels: I) -> Result<(), TrunkError> {
        self.with(|t| t.revoke_labels(labels))
    }

    /// The labels currently free on side A.
    pub fn free_labels(&self) -> Result<BTreeSet<Label>, TrunkError> {
        self.with(|t| Ok(t.free_labels_a().clone()))
    }

    /// Remove the trunk from its aggregator entirely. Refused while any
    /// service holds an allocation on it.
    pub fn decommission(&self) -> Result<(), AggregatorError> {
        let shared = self.agg.upgrade().ok_or(TrunkError::Gone(self.id))?;
        let mut inner = shared.inner.lock().unwrap();
        let state = inner.trunks.get(&self.id).ok_or(TrunkError::Gone(self.id))?;
        if state.in_use() {
            return Err(AggregatorError::TerminalInUse(state.end_a.to_string()));
        }
        inner.trunks.remove(&self.id);
        Ok(())
    }
}

//! Snapshot consistency: token validation, request pins and the compaction
//! watermark.
//!
//! Every read resolves to exactly one snapshot token and holds a
//! [`SnapshotPin`] until it completes. Compaction started by this engine
//! never removes tuple versions an outstanding pin can still observe.
//!
//! Pins are local to one engine. The watermark itself is owned by the tuple
//! store; the manager keeps the highest watermark it has seen so that local
//! pins and compaction agree without a store round trip.

use crate::{
    error::{RebacError, Result},
    models::{SnapshotRange, SnapshotToken},
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct PinState {
    /// Pinned version -> number of outstanding requests
    pins: BTreeMap<u64, usize>,
    /// Oldest snapshot still readable
    watermark: SnapshotToken,
}

/// Tracks pinned snapshots and the garbage-collection watermark
#[derive(Debug, Default)]
pub struct ConsistencyManager {
    state: Mutex<PinState>,
}

impl ConsistencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self) -> SnapshotToken {
        self.state.lock().watermark
    }

    /// Check that `token` is readable within `range`
    pub fn validate(&self, token: SnapshotToken, range: SnapshotRange) -> Result<()> {
        let mut state = self.state.lock();
        Self::observe_locked(&mut state, range.watermark);
        Self::validate_locked(&state, token, range.head)
    }

    /// Raise the local watermark to one published by the store
    pub fn observe_watermark(&self, watermark: SnapshotToken) {
        let mut state = self.state.lock();
        Self::observe_locked(&mut state, watermark);
    }

    fn observe_locked(state: &mut PinState, watermark: SnapshotToken) {
        if watermark > state.watermark {
            debug!(from = %state.watermark, to = %watermark, "Observed newer snapshot watermark");
            state.watermark = watermark;
        }
    }

    fn validate_locked(state: &PinState, token: SnapshotToken, head: SnapshotToken) -> Result<()> {
        if token > head {
            return Err(RebacError::InvalidConsistencyToken(format!(
                "snapshot {} is ahead of the latest commit {}",
                token, head
            )));
        }
        if token < state.watermark {
            return Err(RebacError::SnapshotExpired {
                requested: token,
                watermark: state.watermark,
            });
        }
        Ok(())
    }

    /// Resolve the snapshot a request reads at and pin it.
    ///
    /// With no requested token the request reads at the head of `range`, or
    /// at the watermark when a compaction has moved it past that head since
    /// `range` was read. The watermark is always a committed snapshot, so
    /// such a request never expires here. Validation and pinning happen
    /// under one lock so a concurrent compaction cannot slip between them.
    pub fn pin(
        self: &Arc<Self>,
        requested: Option<SnapshotToken>,
        range: SnapshotRange,
    ) -> Result<SnapshotPin> {
        let mut state = self.state.lock();
        Self::observe_locked(&mut state, range.watermark);

        let head = range.head.max(state.watermark);
        let token = requested.unwrap_or(head);
        Self::validate_locked(&state, token, head)?;
        *state.pins.entry(token.version()).or_insert(0) += 1;

        Ok(SnapshotPin {
            manager: Arc::clone(self),
            token,
        })
    }

    pub fn oldest_pinned(&self) -> Option<SnapshotToken> {
        self.state
            .lock()
            .pins
            .keys()
            .next()
            .copied()
            .map(SnapshotToken)
    }

    pub fn pinned_count(&self) -> usize {
        self.state.lock().pins.values().sum()
    }

    /// `min(oldest pin, head - retained_versions)`, never below the current watermark
    pub fn compaction_watermark(&self, head: SnapshotToken, retained_versions: u64) -> SnapshotToken {
        let state = self.state.lock();
        Self::compute_watermark(&state, head, retained_versions)
    }

    fn compute_watermark(state: &PinState, head: SnapshotToken, retained_versions: u64) -> SnapshotToken {
        let mut candidate = SnapshotToken(head.version().saturating_sub(retained_versions));
        if let Some(&oldest) = state.pins.keys().next() {
            candidate = candidate.min(SnapshotToken(oldest));
        }
        candidate.max(state.watermark)
    }

    /// Compute and publish the new watermark atomically.
    ///
    /// Snapshots below the returned token are rejected from now on, so the
    /// store may drop every version invisible at or above it.
    pub fn advance_watermark(&self, range: SnapshotRange, retained_versions: u64) -> SnapshotToken {
        let mut state = self.state.lock();
        Self::observe_locked(&mut state, range.watermark);
        let watermark = Self::compute_watermark(&state, range.head, retained_versions);
        if watermark > state.watermark {
            debug!(from = %state.watermark, to = %watermark, "Advancing snapshot watermark");
            state.watermark = watermark;
        }
        state.watermark
    }

    fn release(&self, token: SnapshotToken) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(&token.version()) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&token.version());
            }
        }
    }
}

/// Keeps a snapshot readable for as long as it is alive
#[derive(Debug)]
pub struct SnapshotPin {
    manager: Arc<ConsistencyManager>,
    token: SnapshotToken,
}

impl SnapshotPin {
    pub fn token(&self) -> SnapshotToken {
        self.token
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        self.manager.release(self.token);
    }
}

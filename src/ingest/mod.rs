/// Snapshot sources.
///
/// The engine pulls exactly one snapshot per tick from a `SnapshotSource`.
/// A source error is not fatal: the tick runs with an unavailable snapshot
/// and the failure gate counts it.
///
/// Submodules:
/// - `http`: the sensor bridge's JSON endpoint.

pub mod http;

use crate::model::{Snapshot, SourceError};
use std::collections::VecDeque;

pub trait SnapshotSource: Send {
    fn fetch(&mut self) -> Result<Snapshot, SourceError>;
}

/// Returns a scripted sequence of fetch results, then `NoData`.
#[derive(Debug, Default)]
pub struct ManualSource {
    queue: VecDeque<Result<Snapshot, SourceError>>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        self.queue.push_back(Ok(snapshot));
    }

    pub fn push_error(&mut self, err: SourceError) {
        self.queue.push_back(Err(err));
    }
}

impl SnapshotSource for ManualSource {
    fn fetch(&mut self) -> Result<Snapshot, SourceError> {
        self.queue
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::NoData("manual source exhausted".into())))
    }
}

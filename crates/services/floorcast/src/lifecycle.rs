//! Stream lifecycle management
//!
//! Owns the local view of one broadcast's control-plane resources and drives
//! ingestor selection with failover. The control-plane's records are shared
//! mutable state that outlives this process, so nothing here is cached: every
//! selection starts from a fresh `list_ingestors` snapshot and re-checks
//! availability before each attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::control_plane::{
    ControlPlane, ControlPlaneError, Ingestor, IngressEndpoint, RemoteStream, SelectError,
};

/// Lifecycle state of a stream resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Bound,
    TornDown,
}

/// Local handle for a control-plane stream resource
///
/// State only moves forward: created → bound → torn-down, or straight from
/// created to torn-down when no ingestor was ever bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamResource {
    pub id: String,
    pub name: String,
    state: StreamState,
}

impl StreamResource {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: StreamState::Created,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Record that an ingestor is now bound to this stream
    pub fn mark_bound(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            StreamState::Created => {
                self.state = StreamState::Bound;
                Ok(())
            }
            from => Err(LifecycleError::InvalidTransition {
                stream_id: self.id.clone(),
                from,
                to: StreamState::Bound,
            }),
        }
    }

    /// Record that the stream has been deleted. Repeating it is a no-op.
    pub fn mark_torn_down(&mut self) {
        self.state = StreamState::TornDown;
    }
}

/// An ingestor bound to a stream and the capability it handed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub ingestor_id: String,
    pub endpoint: IngressEndpoint,
}

/// Selection candidates drawn from one `list_ingestors` snapshot
///
/// Only available ingestors are kept, in the order the control-plane
/// returned them. Iterating consumes the snapshot, so a candidate that has
/// been handed out can never be attempted again.
#[derive(Debug)]
pub struct Candidates {
    inner: std::vec::IntoIter<Ingestor>,
}

impl Candidates {
    pub fn from_snapshot(snapshot: Vec<Ingestor>) -> Self {
        let available: Vec<Ingestor> = snapshot
            .into_iter()
            .filter(Ingestor::is_available)
            .collect();
        Self {
            inner: available.into_iter(),
        }
    }

    /// Candidates not yet handed out
    pub fn remaining(&self) -> usize {
        self.inner.len()
    }
}

impl Iterator for Candidates {
    type Item = Ingestor;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Outcome of unwinding stale control-plane state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ingestors released
    pub unselected: Vec<String>,

    /// Streams deleted
    pub deleted: Vec<String>,

    /// Resources that could not be released, with the reason
    pub failures: Vec<(String, String)>,
}

/// Stream lifecycle manager
pub struct LifecycleManager {
    control_plane: Arc<dyn ControlPlane>,
    reconciled: AtomicBool,
}

impl LifecycleManager {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            control_plane,
            reconciled: AtomicBool::new(false),
        }
    }

    /// Register a new stream resource
    pub async fn create_stream(&self, name: &str) -> Result<StreamResource, LifecycleError> {
        let id = self.control_plane.create_stream(name).await?;
        Ok(StreamResource::new(id, name))
    }

    /// All streams owned by the account
    pub async fn list_streams(&self) -> Result<Vec<RemoteStream>, ControlPlaneError> {
        self.control_plane.list_streams().await
    }

    /// Fresh snapshot of the ingestors
    pub async fn list_ingestors(&self) -> Result<Vec<Ingestor>, ControlPlaneError> {
        self.control_plane.list_ingestors().await
    }

    /// Bind one named ingestor to a stream
    pub async fn select_ingestor(
        &self,
        ingestor_id: &str,
        stream_id: &str,
    ) -> Result<IngressEndpoint, SelectError> {
        self.control_plane.select_ingestor(ingestor_id, stream_id).await
    }

    /// Release an ingestor. Releasing an unbound ingestor succeeds.
    pub async fn unselect_ingestor(&self, ingestor_id: &str) -> Result<(), ControlPlaneError> {
        self.control_plane.unselect_ingestor(ingestor_id).await
    }

    /// Delete a stream. Deleting a stream that is already gone succeeds.
    pub async fn delete_stream(&self, stream_id: &str) -> Result<(), ControlPlaneError> {
        self.control_plane.delete_stream(stream_id).await
    }

    /// Select the first available ingestor that accepts the stream
    ///
    /// Each candidate of the initial snapshot is attempted at most once. A
    /// candidate that the control-plane no longer reports as available when
    /// its turn comes is skipped without an attempt. Exhausting the snapshot
    /// fails with [`LifecycleError::NoIngestorAvailable`]; there is no retry.
    pub async fn select_any(&self, stream_id: &str) -> Result<Binding, LifecycleError> {
        let mut candidates = Candidates::from_snapshot(self.list_ingestors().await?);
        let candidate_count = candidates.remaining();
        let mut attempted = 0usize;
        let mut first = true;

        tracing::debug!(stream_id = %stream_id, candidates = candidate_count, "Selecting ingestor");

        while let Some(candidate) = candidates.next() {
            if !first {
                let fresh = self.list_ingestors().await?;
                let still_available = fresh
                    .iter()
                    .any(|i| i.id == candidate.id && i.is_available());
                if !still_available {
                    tracing::debug!(
                        ingestor_id = %candidate.id,
                        "Candidate no longer available, skipping"
                    );
                    continue;
                }
            }
            first = false;
            attempted += 1;

            match self.select_ingestor(&candidate.id, stream_id).await {
                Ok(endpoint) => {
                    tracing::info!(
                        stream_id = %stream_id,
                        ingestor_id = %candidate.id,
                        endpoint = %endpoint,
                        attempts = attempted,
                        "Ingestor selected"
                    );
                    return Ok(Binding {
                        ingestor_id: candidate.id,
                        endpoint,
                    });
                }
                Err(SelectError::Unavailable(e)) => {
                    tracing::info!(
                        stream_id = %stream_id,
                        ingestor_id = %candidate.id,
                        remaining = candidates.remaining(),
                        "{}, trying next candidate",
                        e
                    );
                }
                Err(SelectError::ControlPlane(e)) => return Err(e.into()),
            }
        }

        tracing::warn!(
            stream_id = %stream_id,
            candidates = candidate_count,
            attempted = attempted,
            "No ingestor available"
        );
        Err(LifecycleError::NoIngestorAvailable {
            candidates: candidate_count,
            attempted,
        })
    }

    /// Unwind control-plane state left behind by a previous process
    ///
    /// Every listed stream is deleted; for streams that are still bound, the
    /// ingestors reported unavailable are released first. Listing failures
    /// abort; individual release failures are collected and make the whole
    /// reconcile fail so that no session starts on top of stale bindings.
    pub async fn reconcile(&self) -> Result<ReconcileReport, LifecycleError> {
        let streams = self.list_streams().await?;
        let mut report = ReconcileReport::default();

        tracing::info!(streams = streams.len(), "Reconciling control-plane state");

        for stream in streams {
            if stream.is_bound() {
                let ingestors = self.list_ingestors().await?;
                for ingestor in ingestors.iter().filter(|i| !i.is_available()) {
                    if report.unselected.contains(&ingestor.id) {
                        continue;
                    }
                    match self.unselect_ingestor(&ingestor.id).await {
                        Ok(()) => report.unselected.push(ingestor.id.clone()),
                        Err(e) => {
                            tracing::warn!(
                                ingestor_id = %ingestor.id,
                                error = %e,
                                "Failed to release stale ingestor"
                            );
                            report.failures.push((ingestor.id.clone(), e.to_string()));
                        }
                    }
                }
            }

            match self.delete_stream(&stream.id).await {
                Ok(()) => report.deleted.push(stream.id),
                Err(e) => {
                    tracing::warn!(stream_id = %stream.id, error = %e, "Failed to delete stale stream");
                    report.failures.push((stream.id, e.to_string()));
                }
            }
        }

        if !report.failures.is_empty() {
            return Err(LifecycleError::ReconcileIncomplete {
                failed: report.failures.len(),
            });
        }

        self.reconciled.store(true, Ordering::Release);
        tracing::info!(
            unselected = report.unselected.len(),
            deleted = report.deleted.len(),
            "Reconcile complete"
        );
        Ok(report)
    }

    /// Run [`reconcile`](Self::reconcile) unless it already succeeded
    pub async fn ensure_reconciled(&self) -> Result<(), LifecycleError> {
        if self.is_reconciled() {
            return Ok(());
        }
        self.reconcile().await.map(|_| ())
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled.load(Ordering::Acquire)
    }
}

/// Lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error("no ingestor available ({attempted} attempted of {candidates} candidates)")]
    NoIngestorAvailable { candidates: usize, attempted: usize },

    #[error("stream {stream_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        stream_id: String,
        from: StreamState,
        to: StreamState,
    },

    #[error("reconcile left {failed} stale resources behind")]
    ReconcileIncomplete { failed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_keep_order_and_skip_unavailable() {
        let candidates = Candidates::from_snapshot(vec![
            Ingestor::unavailable("A"),
            Ingestor::available("B"),
            Ingestor::unavailable("C"),
            Ingestor::available("D"),
        ]);
        assert_eq!(candidates.remaining(), 2);

        let ids: Vec<String> = candidates.map(|i| i.id).collect();
        assert_eq!(ids, vec!["B", "D"]);
    }

    #[test]
    fn test_candidates_are_handed_out_once() {
        let mut candidates = Candidates::from_snapshot(vec![Ingestor::available("A")]);
        assert_eq!(candidates.next().map(|i| i.id), Some("A".to_string()));
        assert_eq!(candidates.next(), None);
        assert_eq!(candidates.next(), None);
        assert_eq!(candidates.remaining(), 0);
    }

    #[test]
    fn test_empty_snapshot_has_no_candidates() {
        let mut candidates = Candidates::from_snapshot(Vec::new());
        assert_eq!(candidates.size_hint(), (0, Some(0)));
        assert!(candidates.next().is_none());
    }

    #[test]
    fn test_stream_state_is_monotonic() {
        let mut stream = StreamResource::new("stream_1", "demo");
        assert_eq!(stream.state(), StreamState::Created);

        stream.mark_bound().unwrap();
        assert_eq!(stream.state(), StreamState::Bound);
        assert!(stream.mark_bound().is_err());

        stream.mark_torn_down();
        assert_eq!(stream.state(), StreamState::TornDown);
        assert!(matches!(
            stream.mark_bound(),
            Err(LifecycleError::InvalidTransition {
                from: StreamState::TornDown,
                ..
            })
        ));

        stream.mark_torn_down();
        assert_eq!(stream.state(), StreamState::TornDown);
    }
}

//! CandidateBuffer
//!
//! Hält Remote-Candidates zurück, solange die Remote Description fehlt.
//! Nach `flush` werden neue Candidates sofort angewendet.

use super::connection::PeerConnection;
use crate::signaling::NetworkCandidate;
use std::collections::VecDeque;

/// Was mit einem Candidate bei `push` passiert ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    Applied,
    /// Anwenden fehlgeschlagen (nicht fatal)
    Rejected,
}

/// Ergebnis eines `flush`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<NetworkCandidate>,
    pass_through: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_buffering(&self) -> bool {
        !self.pass_through
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Puffert den Candidate oder wendet ihn im Pass-Through-Modus direkt an
    pub async fn push(
        &mut self,
        candidate: NetworkCandidate,
        connection: Option<&dyn PeerConnection>,
    ) -> PushOutcome {
        match connection {
            Some(connection) if self.pass_through => apply(connection, candidate).await,
            _ => {
                self.pending.push_back(candidate);
                tracing::debug!("Buffered remote candidate ({} pending)", self.pending.len());
                PushOutcome::Buffered
            }
        }
    }

    /// Wendet alle gepufferten Candidates in FIFO-Reihenfolge an und
    /// wechselt in den Pass-Through-Modus
    pub async fn flush(&mut self, connection: &dyn PeerConnection) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            match apply(connection, candidate).await {
                PushOutcome::Applied => report.applied += 1,
                _ => report.rejected += 1,
            }
        }
        self.pass_through = true;

        if report.applied + report.rejected > 0 {
            tracing::debug!(
                "Flushed candidates: {} applied, {} rejected",
                report.applied,
                report.rejected
            );
        }
        report
    }

    /// Zurück in den Puffer-Modus (neue Connection); wartende Candidates bleiben erhalten
    pub fn reset(&mut self) {
        self.pass_through = false;
    }

    /// Verwirft alles (Teardown)
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pass_through = false;
    }
}

async fn apply(connection: &dyn PeerConnection, candidate: NetworkCandidate) -> PushOutcome {
    match connection.add_candidate(candidate).await {
        Ok(()) => PushOutcome::Applied,
        Err(e) => {
            tracing::debug!("Remote candidate rejected: {}", e);
            PushOutcome::Rejected
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

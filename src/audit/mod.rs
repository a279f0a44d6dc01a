//! Audit digests
//!
//! Every finished run stores a SHA-256 over its full event log, so the
//! record can later be checked against the log it claims to summarise.

use crate::events::RunEvent;
use crate::models::{DecisionPacket, Run};
use sha2::{Digest, Sha256};
use std::io::Write;

/// Outcome of re-checking a stored run against its event log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AuditVerification {
    pub run_id: String,
    pub stored_digest: Option<String>,
    pub computed_digest: String,
    /// Digest of the stored decision packet, for comparing replays.
    pub decision_digest: Option<String>,
    pub sequence_gap_free: bool,
    pub valid: bool,
}

/// SHA-256 over the canonical JSON of each event, in sequence order.
/// Uses zero-copy streaming serialization into hasher
pub fn event_log_digest(events: &[RunEvent]) -> String {
    let mut hasher = Sha256::new();

    for event in events {
        if serde_json::to_writer(&mut HashWriter(&mut hasher), event).is_err() {
            return String::new();
        }
        hasher.update(b"\n");
    }

    hex::encode(hasher.finalize())
}

/// SHA-256 of a decision packet, for replay comparison.
pub fn decision_digest(packet: &DecisionPacket) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), packet).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Sequence numbers start at 1 and increase by exactly one.
pub fn is_gap_free(events: &[RunEvent]) -> bool {
    events
        .iter()
        .enumerate()
        .all(|(i, event)| event.seq == i as u64 + 1)
}

/// Recompute the digest of `events` and compare it with the one on `run`.
pub fn verify_run(run: &Run, events: &[RunEvent]) -> AuditVerification {
    let computed_digest = event_log_digest(events);
    let sequence_gap_free = is_gap_free(events);
    let valid = sequence_gap_free
        && run.audit_digest.as_deref() == Some(computed_digest.as_str());

    AuditVerification {
        run_id: run.run_id.clone(),
        stored_digest: run.audit_digest.clone(),
        computed_digest,
        decision_digest: run.decision_packet.as_ref().map(decision_digest),
        sequence_gap_free,
        valid,
    }
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

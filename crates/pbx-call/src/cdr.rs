//! Call detail record sink (§6 "CDR sink"): `startRecord`/`endRecord`,
//! invoked by the Call Manager's wiring layer on answer and end.

use async_trait::async_trait;
use tracing::info;

use crate::call::Call;

/// Closed, typed disposition instead of a free string (supplemented
/// from the original implementation's CDR handling, which left the
/// disposition vocabulary implicit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
    VoicemailDeposit,
}

/// Implemented by whatever persists call detail records; the core only
/// ever calls `start_record` on answer and `end_record` on hangup.
#[async_trait]
pub trait CdrSink: Send + Sync {
    async fn start_record(&self, call: &Call);
    async fn end_record(&self, call: &Call, disposition: Disposition);
}

/// No-op sink for deployments that don't want CDRs, and for tests that
/// don't care about them.
pub struct NullCdrSink;

#[async_trait]
impl CdrSink for NullCdrSink {
    async fn start_record(&self, _call: &Call) {}
    async fn end_record(&self, _call: &Call, _disposition: Disposition) {}
}

/// Emits one structured log line per call boundary instead of persisting
/// anywhere; a real deployment swaps this for a database- or file-backed
/// `CdrSink`, but this gives `pbxd` usable CDRs without inventing a
/// storage backend out of scope for the core.
pub struct TracingCdrSink;

#[async_trait]
impl CdrSink for TracingCdrSink {
    async fn start_record(&self, call: &Call) {
        info!(call_id = %call.id, from = %call.from, to = %call.to, "cdr: call answered");
    }

    async fn end_record(&self, call: &Call, disposition: Disposition) {
        info!(
            call_id = %call.id,
            from = %call.from,
            to = %call.to,
            duration_ms = call.duration().num_milliseconds(),
            disposition = ?disposition,
            "cdr: call ended"
        );
    }
}

// Seeding policy for externally supplied content ("set content").
//
// Replicated state always wins over a persisted snapshot:
// - before the first sync the request is parked (the latest request replaces
//   an earlier one) until sync completes or the deadline passes;
// - once synced, or when editing locally only, content is applied only if
//   the live document is still empty;
// - at the deadline parked content is force-applied, again only into an
//   empty document.

use std::time::Duration;

use tandem_common::types::DocumentContent;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPhase {
    /// No authoritative state merged yet.
    AwaitingSync,
    Synced,
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedDecision {
    Apply(DocumentContent),
    Deferred { deadline: Instant },
    /// The live document already has content; the request is dropped.
    Conflict,
    Nothing,
}

#[derive(Debug, Clone)]
struct PendingSeed {
    content: DocumentContent,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct SeedGate {
    pending: Option<PendingSeed>,
}

impl SeedGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(
        &mut self,
        content: DocumentContent,
        phase: SeedPhase,
        document_empty: bool,
        now: Instant,
        timeout: Duration,
    ) -> SeedDecision {
        match phase {
            SeedPhase::AwaitingSync => {
                // A newer request replaces the content but not the deadline.
                let deadline = self.pending.as_ref().map_or(now + timeout, |pending| pending.deadline);
                self.pending = Some(PendingSeed { content, deadline });
                SeedDecision::Deferred { deadline }
            }
            SeedPhase::Synced | SeedPhase::LocalOnly => {
                self.pending = None;
                decide(content, document_empty)
            }
        }
    }

    /// Release parked content once sync completes or the session goes
    /// local-only.
    pub fn settle(&mut self, document_empty: bool) -> SeedDecision {
        match self.pending.take() {
            Some(pending) => decide(pending.content, document_empty),
            None => SeedDecision::Nothing,
        }
    }

    /// Force-apply parked content whose deadline has passed.
    pub fn expire(&mut self, now: Instant, document_empty: bool) -> SeedDecision {
        let due = self.pending.as_ref().is_some_and(|pending| now >= pending.deadline);
        if due {
            self.settle(document_empty)
        } else {
            SeedDecision::Nothing
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.deadline)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

fn decide(content: DocumentContent, document_empty: bool) -> SeedDecision {
    if document_empty {
        SeedDecision::Apply(content)
    } else {
        SeedDecision::Conflict
    }
}

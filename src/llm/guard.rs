use std::collections::HashSet;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    ImageAnalysis,
    Chat,
}

impl CallKind {
    pub fn label(self) -> &'static str {
        match self {
            CallKind::ImageAnalysis => "image_analysis",
            CallKind::Chat => "chat",
        }
    }
}

/// Advisory per-kind latch: at most one call of each kind in flight for the
/// owning instance. Rejected calls are dropped, never queued.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    in_flight: Mutex<HashSet<CallKind>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self, kind: CallKind) -> bool {
        self.in_flight.lock().insert(kind)
    }

    pub fn exit(&self, kind: CallKind) {
        self.in_flight.lock().remove(&kind);
    }

    pub fn is_in_flight(&self, kind: CallKind) -> bool {
        self.in_flight.lock().contains(&kind)
    }

    /// Like `try_enter`, but the latch is released when the permit drops.
    pub fn enter(&self, kind: CallKind) -> Option<GuardPermit<'_>> {
        // Lazily built: a permit dropped on the rejected path would release
        // the latch held by the in-flight call.
        self.try_enter(kind)
            .then(|| GuardPermit { guard: self, kind })
    }
}

#[must_use = "the latch is released as soon as the permit is dropped"]
pub struct GuardPermit<'a> {
    guard: &'a ConcurrencyGuard,
    kind: CallKind,
}

impl Drop for GuardPermit<'_> {
    fn drop(&mut self) {
        self.guard.exit(self.kind);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// One-way shutdown signal shared by every loop of a session.
///
/// Starts live. Any holder may clear it; once cleared it never becomes live again.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag. Returns `true` for the call that actually cleared it.
    pub fn clear(&self, reason: &str) -> bool {
        let was_live = self.0.swap(false, Ordering::AcqRel);
        if was_live {
            info!(reason, "Liveness cleared");
        }
        was_live
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_is_one_shot() {
        let flag = Liveness::new();
        let shared = flag.clone();
        assert!(flag.is_live());

        assert!(shared.clear("receiver closed"));
        assert!(!flag.clear("second reason"));
        assert!(!flag.is_live());
        assert!(!shared.is_live());
    }
}

use std::sync::atomic::{AtomicBool, Ordering};

/// One configuration generation of a listener's per-connection quotas.
///
/// The listener hands the current epoch to every connection. When the per-connection
/// quotas change, the listener retires the epoch and installs a fresh one in the same
/// critical section, so a connection holding a retired epoch knows its next snapshot
/// contains newer quotas. Retirement is one-way.
#[derive(Debug, Default)]
pub struct ConfigEpoch {
    retired: AtomicBool,
}

impl ConfigEpoch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once a newer configuration has been published.
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_is_one_way() {
        let epoch = ConfigEpoch::new();
        assert!(!epoch.is_retired());

        epoch.retire();
        assert!(epoch.is_retired());

        epoch.retire();
        assert!(epoch.is_retired());
    }
}

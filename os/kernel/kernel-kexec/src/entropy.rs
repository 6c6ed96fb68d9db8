use core::sync::atomic::{AtomicBool, Ordering};

/// One-way flag raised once the random pool is fully seeded.
///
/// The device tree patcher only feeds a `kaslr-seed` to the next kernel
/// after the gate has fired. It is raised from whatever context finishes
/// seeding and read during image load.
#[derive(Debug, Default)]
pub struct EntropyGate {
    ready: AtomicBool,
}

impl EntropyGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once() {
        static GATE: EntropyGate = EntropyGate::new();
        assert!(!GATE.is_ready());
        GATE.mark_ready();
        GATE.mark_ready();
        assert!(GATE.is_ready());
    }
}

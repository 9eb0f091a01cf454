//! Store backends the simulator can drive.

use simplebank_ledger::{MemoryStore, PgStore, Store, StoreFault};

/// A store the simulator can run against, with optional fault injection.
pub trait SimStore: Store {
    /// Whether [`SimStore::inject_fault`] has any effect on this backend.
    fn supports_faults(&self) -> bool;

    /// Inject a fault. Returns false when the backend cannot produce faults.
    fn inject_fault(&self, fault: StoreFault) -> bool;

    fn clear_faults(&self);

    fn name(&self) -> &'static str;
}

impl SimStore for MemoryStore {
    fn supports_faults(&self) -> bool {
        true
    }

    fn inject_fault(&self, fault: StoreFault) -> bool {
        MemoryStore::inject_fault(self, fault);
        true
    }

    fn clear_faults(&self) {
        MemoryStore::clear_faults(self);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl SimStore for PgStore {
    fn supports_faults(&self) -> bool {
        false
    }

    fn inject_fault(&self, _fault: StoreFault) -> bool {
        false
    }

    fn clear_faults(&self) {}

    fn name(&self) -> &'static str {
        "postgres"
    }
}

use std::collections::HashMap;

use trinetra_types::{CameraId, CustomerId, Embedding, Timestamp};

/// Where and when a customer was last confirmed, plus the embedding seen
/// then (the base for the gallery EMA update).
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub camera: CameraId,
    pub last_seen: Timestamp,
    pub embedding: Embedding,
}

/// In-memory record of currently-present customers.
///
/// Owned by the single resolver consumer task; every read and write funnels
/// through it, so no lock is needed. Entries expire after the temporal gate
/// window, enforced both lazily (the gate treats an expired entry as
/// absent) and by periodic sweeps, which bounds memory by the count of
/// customers active within the window.
#[derive(Default)]
pub struct ActiveIdentityRegistry {
    entries: HashMap<CustomerId, RegistryEntry>,
}

impl ActiveIdentityRegistry {
    pub fn get(&self, customer: &CustomerId) -> Option<&RegistryEntry> {
        self.entries.get(customer)
    }

    pub fn set(
        &mut self,
        customer: CustomerId,
        camera: CameraId,
        last_seen: Timestamp,
        embedding: Embedding,
    ) {
        self.entries.insert(
            customer,
            RegistryEntry {
                camera,
                last_seen,
                embedding,
            },
        );
    }

    pub fn remove(&mut self, customer: &CustomerId) {
        self.entries.remove(customer);
    }

    /// Delete entries older than `window_s`. Returns how many went.
    pub fn sweep_expired(&mut self, now: Timestamp, window_s: f64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.seconds_since(entry.last_seen) <= window_s);
        before - self.entries.len()
    }

    /// Evict everything, e.g. on a store-close signal.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_ts(registry: &ActiveIdentityRegistry, id: &str) -> Option<f64> {
        registry
            .get(&CustomerId::new(id))
            .map(|e| e.last_seen.as_f64())
    }

    #[test]
    fn set_get_overwrites() {
        let mut registry = ActiveIdentityRegistry::default();
        let id = CustomerId::new("cust_a");
        registry.set(
            id.clone(),
            CameraId::new("entrance"),
            Timestamp::from_f64(1000.0),
            Embedding::unit_in_dim(0),
        );
        registry.set(
            id.clone(),
            CameraId::new("billing"),
            Timestamp::from_f64(1200.0),
            Embedding::unit_in_dim(0),
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().camera, CameraId::new("billing"));
        assert_eq!(entry_ts(&registry, "cust_a"), Some(1200.0));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut registry = ActiveIdentityRegistry::default();
        registry.set(
            CustomerId::new("old"),
            CameraId::new("entrance"),
            Timestamp::from_f64(0.0),
            Embedding::unit_in_dim(0),
        );
        registry.set(
            CustomerId::new("fresh"),
            CameraId::new("entrance"),
            Timestamp::from_f64(3500.0),
            Embedding::unit_in_dim(1),
        );
        let removed = registry.sweep_expired(Timestamp::from_f64(3700.0), 3600.0);
        assert_eq!(removed, 1);
        assert!(registry.get(&CustomerId::new("old")).is_none());
        assert!(registry.get(&CustomerId::new("fresh")).is_some());
    }
}

//! Interface registry
//!
//! Resolves an [`InterfaceId`] to a published [`CapabilityHandle`] once, when
//! a consumer is wired up. Entries hold the handle without counting as a
//! reference; every successful query hands out an acquired one.

use crate::capability::{CapabilityHandle, InterfaceDescriptor};
use interface::{DescriptorHeader, InterfaceError, InterfaceId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    entries: RwLock<HashMap<InterfaceId, Arc<CapabilityHandle>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a handle under its identifier
    pub fn publish(&self, handle: Arc<CapabilityHandle>) -> Result<(), InterfaceError> {
        let id = handle.id();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(InterfaceError::AlreadyPublished(id));
        }

        info!(interface = %id, offered = %handle.offered(), "Interface published");
        entries.insert(id, handle);
        Ok(())
    }

    /// Remove a published handle; references already handed out stay valid
    pub fn withdraw(&self, id: InterfaceId) -> Option<Arc<CapabilityHandle>> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            info!(interface = %id, "Interface withdrawn");
        }
        removed
    }

    pub fn contains(&self, id: InterfaceId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Look up `id` and negotiate `requested` against what the provider offers
    ///
    /// The returned descriptor carries the smaller of both sizes and versions
    /// and holds one acquired reference.
    pub fn query(
        &self,
        id: InterfaceId,
        requested: DescriptorHeader,
    ) -> Result<InterfaceDescriptor, InterfaceError> {
        let handle = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(InterfaceError::NotFound(id))?;

        let offered = handle.offered();
        let negotiated = requested
            .has_base()
            .then(|| requested.negotiate(&offered))
            .flatten()
            .ok_or(InterfaceError::CapabilityUnavailable {
                requested: requested.version,
                requested_size: requested.size,
                offered: offered.version,
                offered_size: offered.size,
            })?;

        let reference = handle
            .try_acquire()
            .ok_or(InterfaceError::Invalidated(id))?;

        debug!(interface = %id, %requested, %offered, %negotiated, "Interface negotiated");
        Ok(InterfaceDescriptor::new(negotiated, reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusProvider;
    use crate::config::ProviderConfig;
    use interface::{
        BASE_DESCRIPTOR_SIZE, CURRENT_VERSION, FORWARD_PROGRESS_INTERFACE_ID, InterfaceVersion,
    };

    fn published() -> (InterfaceRegistry, Arc<BusProvider>) {
        let registry = InterfaceRegistry::new();
        let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
        provider.publish(&registry).unwrap();
        (registry, provider)
    }

    #[test]
    fn test_query_unknown_interface() {
        let registry = InterfaceRegistry::new();
        let err = registry
            .query(
                FORWARD_PROGRESS_INTERFACE_ID,
                DescriptorHeader::for_version(CURRENT_VERSION),
            )
            .unwrap_err();
        assert_eq!(err, InterfaceError::NotFound(FORWARD_PROGRESS_INTERFACE_ID));
    }

    #[test]
    fn test_publish_twice_fails() {
        let (registry, provider) = published();
        assert_eq!(
            provider.publish(&registry).unwrap_err(),
            InterfaceError::AlreadyPublished(FORWARD_PROGRESS_INTERFACE_ID)
        );
        provider.shutdown();
    }

    #[test]
    fn test_query_negotiates_down() {
        let (registry, provider) = published();

        let descriptor = registry
            .query(
                FORWARD_PROGRESS_INTERFACE_ID,
                DescriptorHeader::for_version(InterfaceVersion::V1),
            )
            .unwrap();
        assert_eq!(descriptor.effective_version(), Some(InterfaceVersion::V1));
        assert!(descriptor.v2().is_none());

        let descriptor = registry
            .query(
                FORWARD_PROGRESS_INTERFACE_ID,
                DescriptorHeader::for_version(CURRENT_VERSION),
            )
            .unwrap();
        assert!(descriptor.v2().is_some());
        provider.shutdown();
    }

    #[test]
    fn test_query_below_base_is_unavailable() {
        let (registry, provider) = published();
        let requested = DescriptorHeader {
            size: BASE_DESCRIPTOR_SIZE - 8,
            version: InterfaceVersion::V1,
        };
        let err = registry
            .query(FORWARD_PROGRESS_INTERFACE_ID, requested)
            .unwrap_err();
        assert!(matches!(err, InterfaceError::CapabilityUnavailable { .. }));
        provider.shutdown();
    }

    #[test]
    fn test_query_after_invalidation() {
        let (registry, provider) = published();
        provider.retire();
        let err = registry
            .query(
                FORWARD_PROGRESS_INTERFACE_ID,
                DescriptorHeader::for_version(CURRENT_VERSION),
            )
            .unwrap_err();
        assert_eq!(err, InterfaceError::Invalidated(FORWARD_PROGRESS_INTERFACE_ID));
    }
}

//! Interned descriptors keyed by `(service, method)`.

use std::sync::Arc;

use dashmap::DashMap;

use crate::descriptor::InvocationDescriptor;

#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: DashMap<(String, String), Arc<InvocationDescriptor>>,
}

impl DescriptorCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, service: &str, method: &str) -> Option<Arc<InvocationDescriptor>> {
        self.entries
            .get(&(service.to_owned(), method.to_owned()))
            .map(|e| e.value().clone())
    }

    /// Intern `descriptor`, returning the entry that ends up cached.
    ///
    /// When two resolutions race, the first insert wins so every caller
    /// shares one descriptor.
    pub fn insert(
        &self,
        service: &str,
        method: &str,
        descriptor: InvocationDescriptor,
    ) -> Arc<InvocationDescriptor> {
        self.entries
            .entry((service.to_owned(), method.to_owned()))
            .or_insert_with(|| Arc::new(descriptor))
            .value()
            .clone()
    }

    pub fn invalidate(&self, service: &str, method: &str) {
        if self
            .entries
            .remove(&(service.to_owned(), method.to_owned()))
            .is_some()
        {
            tracing::debug!(service, method, "descriptor invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

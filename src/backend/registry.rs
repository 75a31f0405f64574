//! Name-keyed lookup of backend plugins.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BackendError;

use super::Backend;

/// The set of backends a carrier instance knows how to drive. Built once at
/// startup and shared read-only afterwards.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, BackendError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    #[test]
    fn lookup_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(LocalBackend::new(dir.path())));

        assert!(registry.get("local").is_ok());
        assert!(matches!(
            registry.get("condor"),
            Err(BackendError::UnknownBackend(_))
        ));
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::UpdateError;
use crate::module::UpdateModule;

/// Dispatches artifact-parser payload calls to the module registered for
/// that payload's type name.
///
/// Registration transfers ownership of the module to the registry (§4.4):
/// once registered, a payload type stays registered for the lifetime of the
/// agent. The parser consults this registry to resolve a module before it
/// accepts any data for a given payload.
#[derive(Default)]
pub struct UpdateModuleRegistry {
    modules: HashMap<String, Arc<dyn UpdateModule>>,
}

impl UpdateModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn UpdateModule>) -> Result<(), UpdateError> {
        let name = module.type_name().to_string();
        if self.modules.contains_key(&name) {
            return Err(UpdateError::AlreadyRegistered(name));
        }
        self.modules.insert(name, module);
        Ok(())
    }

    pub fn resolve(&self, payload_type: &str) -> Result<Arc<dyn UpdateModule>, UpdateError> {
        self.modules
            .get(payload_type)
            .cloned()
            .ok_or_else(|| UpdateError::ModuleNotConfigured(payload_type.to_string()))
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.modules.keys().map(|s| s.as_str()).collect()
    }
}

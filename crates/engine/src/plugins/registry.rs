//! Explicit, typed plugin registration (spec §4.5, §9 Design Notes — no
//! reflection over a plugin namespace; plugins register by name at link
//! time via a fixed constructor map).

use std::collections::HashMap;
use std::sync::Arc;

use leasemgr_common::error::ManagerError;

use super::dummy::DummyResourcePlugin;
use super::ResourcePlugin;
use crate::error::EngineResult;

type PluginConstructor = fn() -> Arc<dyn ResourcePlugin>;

/// Everything this build knows how to instantiate, keyed by plugin name
/// (not resource type — two names could theoretically claim the same
/// resource type, which `PluginRegistry::load` must reject).
fn known_plugins() -> HashMap<&'static str, PluginConstructor> {
    let mut m: HashMap<&'static str, PluginConstructor> = HashMap::new();
    m.insert("dummy.vm.plugin", || Arc::new(DummyResourcePlugin::new()));
    m
}

pub struct PluginRegistry {
    by_resource_type: HashMap<String, Arc<dyn ResourcePlugin>>,
}

impl PluginRegistry {
    /// Load the plugins named in config, failing startup if a name is
    /// unknown or if two configured plugins claim the same resource type.
    pub async fn load(plugin_names: &[String]) -> EngineResult<Self> {
        let constructors = known_plugins();
        let mut by_resource_type = HashMap::new();

        for name in plugin_names {
            let constructor = constructors.get(name.as_str()).ok_or_else(|| {
                ManagerError::PluginConfigurationError(format!(
                    "no plugin registered under the name `{name}`"
                ))
            })?;
            let plugin = constructor();
            plugin.setup(&HashMap::new()).await?;
            let resource_type = plugin.resource_type().to_string();
            if by_resource_type.contains_key(&resource_type) {
                return Err(ManagerError::PluginConfigurationError(format!(
                    "two plugins claim resource type `{resource_type}`"
                )));
            }
            by_resource_type.insert(resource_type, plugin);
        }

        Ok(Self { by_resource_type })
    }

    /// Build a registry directly from already-constructed plugins —
    /// used by tests that want a custom `DummyResourcePlugin` pool.
    pub fn from_plugins(plugins: Vec<Arc<dyn ResourcePlugin>>) -> EngineResult<Self> {
        let mut by_resource_type = HashMap::new();
        for plugin in plugins {
            let resource_type = plugin.resource_type().to_string();
            if by_resource_type.contains_key(&resource_type) {
                return Err(ManagerError::PluginConfigurationError(format!(
                    "two plugins claim resource type `{resource_type}`"
                )));
            }
            by_resource_type.insert(resource_type, plugin);
        }
        Ok(Self { by_resource_type })
    }

    pub fn resolve(&self, resource_type: &str) -> EngineResult<Arc<dyn ResourcePlugin>> {
        self.by_resource_type
            .get(resource_type)
            .cloned()
            .ok_or_else(|| ManagerError::UnsupportedResourceType(resource_type.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ResourcePlugin>> {
        self.by_resource_type.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_plugin_name_fails_startup() {
        let err = PluginRegistry::load(&["no.such.plugin".to_string()]).await.unwrap_err();
        assert!(matches!(err, ManagerError::PluginConfigurationError(_)));
    }

    #[tokio::test]
    async fn loads_the_default_dummy_plugin() {
        let registry = PluginRegistry::load(&["dummy.vm.plugin".to_string()]).await.unwrap();
        assert!(registry.resolve("dummy.vm.plugin").is_ok());
    }

    #[tokio::test]
    async fn unsupported_resource_type_is_rejected() {
        let registry = PluginRegistry::load(&["dummy.vm.plugin".to_string()]).await.unwrap();
        let err = registry.resolve("network").unwrap_err();
        assert!(matches!(err, ManagerError::UnsupportedResourceType(_)));
    }

    #[test]
    fn duplicate_resource_type_across_plugins_is_rejected() {
        let a: Arc<dyn ResourcePlugin> = Arc::new(DummyResourcePlugin::new());
        let b: Arc<dyn ResourcePlugin> = Arc::new(DummyResourcePlugin::new());
        let err = PluginRegistry::from_plugins(vec![a, b]).unwrap_err();
        assert!(matches!(err, ManagerError::PluginConfigurationError(_)));
    }
}

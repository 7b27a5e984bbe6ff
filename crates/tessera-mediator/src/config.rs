//! Mediator configuration.
//!
//! ```toml
//! [cache]
//! sticky = ["Site"]
//!
//! [lazy_loading]
//! enabled = true
//!
//! [reader]
//! invert_queries = false
//!
//! [[corrective_update]]
//! entity = "Specimen"
//! attribute = "label"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tessera_types::{EntityRef, Registry};

use crate::error::{MediatorError, MediatorResult};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MediatorConfig {
    pub cache: CacheConfig,
    pub lazy_loading: LazyLoadingConfig,
    pub reader: ReaderConfig,
    /// Attributes the service regenerates on create but whose submitted
    /// value must be restored by a follow-up update.
    pub corrective_update: Vec<CorrectiveUpdate>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Types kept across a non-forced cache clear.
    pub sticky: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LazyLoadingConfig {
    pub enabled: bool,
}

impl Default for LazyLoadingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    /// Search through the referenced entity's inverse attribute instead of
    /// sending a reference criterion.
    pub invert_queries: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrectiveUpdate {
    pub entity: String,
    pub attribute: String,
}

impl MediatorConfig {
    pub fn from_toml_str(text: &str) -> MediatorResult<Self> {
        toml::from_str(text).map_err(|e| MediatorError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> MediatorResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MediatorError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> MediatorResult<String> {
        toml::to_string(self).map_err(|e| MediatorError::Config(e.to_string()))
    }

    /// Check every type and attribute named here against `registry`.
    pub fn validate(&self, registry: &Registry) -> MediatorResult<()> {
        for type_name in &self.cache.sticky {
            if !registry.contains(type_name) {
                return Err(MediatorError::Config(format!("sticky type {type_name} is not registered")));
            }
        }
        for entry in &self.corrective_update {
            let descriptor = registry.get(&entry.entity).ok_or_else(|| {
                MediatorError::Config(format!("corrective update names unknown type {}", entry.entity))
            })?;
            let attribute = descriptor.attribute_named(&entry.attribute).ok_or_else(|| {
                MediatorError::Config(format!(
                    "corrective update names unknown attribute {}.{}",
                    entry.entity, entry.attribute
                ))
            })?;
            if attribute.is_reference() {
                return Err(MediatorError::Config(format!(
                    "corrective update attribute {}.{} must be a scalar",
                    entry.entity, entry.attribute
                )));
            }
        }
        Ok(())
    }

    /// Corrective-update attributes that apply to `entity`.
    pub fn corrective_attributes(&self, entity: &EntityRef) -> Vec<String> {
        self.corrective_update
            .iter()
            .filter(|entry| entity.is_a(&entry.entity))
            .map(|entry| entry.attribute.clone())
            .collect()
    }
}

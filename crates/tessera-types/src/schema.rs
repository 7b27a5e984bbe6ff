//! TOML schema documents for domain metadata.
//!
//! ```toml
//! [[entity]]
//! name = "Person"
//! secondary_key = ["name"]
//!
//! [[entity.attribute]]
//! name = "name"
//! type = "text"
//! mandatory = true
//!
//! [[entity.attribute]]
//! name = "addresses"
//! references = "Address"
//! cardinality = "many"
//! role = "dependent"
//! inverse = "person"
//! cascaded = true
//! ```

use serde::Deserialize;

use crate::error::{MetadataError, MetadataResult};
use crate::metadata::{AttributeDescriptor, Cardinality, FetchMode, Role, ScalarType, TypeDescriptor};
use crate::registry::Registry;
use crate::value::Scalar;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaDocument {
    #[serde(default, rename = "entity")]
    entities: Vec<EntitySchema>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntitySchema {
    name: String,
    #[serde(default)]
    extends: Option<String>,
    #[serde(default, rename = "abstract")]
    is_abstract: bool,
    #[serde(default)]
    secondary_key: Vec<String>,
    #[serde(default)]
    alternate_key: Vec<String>,
    #[serde(default)]
    proxy: Option<ProxySchema>,
    #[serde(default, rename = "attribute")]
    attributes: Vec<AttributeSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProxySchema {
    entity: String,
    attribute: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttributeSchema {
    name: String,
    #[serde(default, rename = "type")]
    scalar: Option<ScalarType>,
    #[serde(default)]
    references: Option<String>,
    #[serde(default)]
    cardinality: Cardinality,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    fetch: Option<FetchMode>,
    #[serde(default)]
    inverse: Option<String>,
    #[serde(default)]
    cascaded: bool,
    #[serde(default)]
    cascade_update: bool,
    #[serde(default)]
    cascade_update_to_create: bool,
    #[serde(default)]
    autogenerated: bool,
    #[serde(default)]
    mandatory: bool,
    #[serde(default = "default_true")]
    updatable: bool,
    #[serde(default)]
    searchable: Option<bool>,
    #[serde(default)]
    default: Option<Scalar>,
}

fn default_true() -> bool {
    true
}

impl AttributeSchema {
    fn into_descriptor(self, entity: &str) -> MetadataResult<AttributeDescriptor> {
        let mut descriptor = match (self.scalar, self.references) {
            (Some(scalar), None) => AttributeDescriptor::scalar(&self.name, scalar),
            (None, Some(target)) => {
                let role = self.role.unwrap_or(Role::Independent);
                if role == Role::Value {
                    return Err(MetadataError::Parse(format!(
                        "{entity}.{}: a reference cannot have the value role",
                        self.name
                    )));
                }
                AttributeDescriptor::reference(&self.name, &target, self.cardinality, role)
            }
            _ => {
                return Err(MetadataError::Parse(format!(
                    "{entity}.{}: exactly one of `type` and `references` is required",
                    self.name
                )))
            }
        };
        if let Some(fetch) = self.fetch {
            descriptor.fetch = fetch;
        }
        if let Some(searchable) = self.searchable {
            descriptor.searchable = searchable;
        }
        descriptor.inverse = self.inverse;
        descriptor.cascaded = self.cascaded;
        descriptor.cascade_update = self.cascade_update;
        descriptor.cascade_update_to_create = self.cascade_update_to_create;
        descriptor.autogenerated = self.autogenerated;
        descriptor.mandatory = self.mandatory;
        descriptor.updatable = self.updatable;
        descriptor.default = self.default;
        Ok(descriptor)
    }
}

impl Registry {
    /// Build a registry from a TOML schema document.
    pub fn from_toml_str(source: &str) -> MetadataResult<Registry> {
        let document: SchemaDocument =
            toml::from_str(source).map_err(|e| MetadataError::Parse(e.to_string()))?;
        let mut builder = Registry::builder();
        for entity in document.entities {
            let mut descriptor = TypeDescriptor::new(&entity.name);
            if let Some(parent) = &entity.extends {
                descriptor = descriptor.extends(parent);
            }
            if entity.is_abstract {
                descriptor = descriptor.abstract_type();
            }
            descriptor.secondary_key = entity.secondary_key;
            descriptor.alternate_key = entity.alternate_key;
            if let Some(proxy) = &entity.proxy {
                descriptor = descriptor.proxied_by(&proxy.entity, &proxy.attribute);
            }
            for attribute in entity.attributes {
                descriptor = descriptor.attribute(attribute.into_descriptor(&entity.name)?);
            }
            builder = builder.entity(descriptor);
        }
        builder.build()
    }
}

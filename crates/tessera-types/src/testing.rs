//! Registry shared by this crate's tests.

use crate::metadata::{AttributeDescriptor, Cardinality, FetchMode, TypeDescriptor};
use crate::registry::Registry;
use crate::value::Scalar;

pub(crate) fn sample_registry() -> Registry {
    Registry::builder()
        .entity(
            TypeDescriptor::new("Person")
                .attribute(AttributeDescriptor::text("name").mandatory())
                .attribute(AttributeDescriptor::int("age"))
                .attribute(
                    AttributeDescriptor::text("status").with_default(Scalar::Text("active".into())),
                )
                .attribute(
                    AttributeDescriptor::dependents("addresses", "Address")
                        .with_inverse("person")
                        .cascaded()
                        .with_fetch(FetchMode::Eager),
                )
                .attribute(AttributeDescriptor::independent("site", "Site", Cardinality::One))
                .secondary_key(&["name"]),
        )
        .entity(
            TypeDescriptor::new("Address")
                .attribute(AttributeDescriptor::text("kind"))
                .attribute(AttributeDescriptor::text("street"))
                .attribute(AttributeDescriptor::owner("person", "Person").with_inverse("addresses"))
                .secondary_key(&["kind", "person"]),
        )
        .entity(
            TypeDescriptor::new("Site")
                .attribute(AttributeDescriptor::text("name"))
                .secondary_key(&["name"]),
        )
        .build()
        .expect("sample registry is valid")
}

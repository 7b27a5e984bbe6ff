//! Domain model and harness shared by this crate's tests.

use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tessera_remote::{InMemoryService, RemoteService, ServiceOptions};
use tessera_types::{
    AttributeDescriptor, Cardinality, EntityRef, FetchMode, Identifier, Registry, Role, Scalar,
    TypeDescriptor,
};

use crate::config::MediatorConfig;
use crate::database::Database;

pub(crate) fn registry() -> Rc<Registry> {
    let registry = Registry::builder()
        .entity(
            TypeDescriptor::new("Person")
                .attribute(AttributeDescriptor::text("name").mandatory())
                .attribute(AttributeDescriptor::int("age"))
                .attribute(AttributeDescriptor::text("status").with_default(Scalar::Text("active".into())))
                .attribute(
                    AttributeDescriptor::dependents("addresses", "Address")
                        .with_inverse("person")
                        .cascaded()
                        .with_fetch(FetchMode::Eager),
                )
                .attribute(
                    AttributeDescriptor::independent("site", "Site", Cardinality::One)
                        .with_fetch(FetchMode::Toxic),
                )
                .attribute(
                    AttributeDescriptor::independent("accounts", "Account", Cardinality::Many)
                        .with_inverse("holder"),
                )
                .attribute(AttributeDescriptor::dependents("consents", "Consent").with_inverse("person"))
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
            TypeDescriptor::new("Account")
                .attribute(AttributeDescriptor::text("number"))
                .attribute(AttributeDescriptor::int("balance"))
                .attribute(
                    AttributeDescriptor::independent("holder", "Person", Cardinality::One)
                        .with_inverse("accounts")
                        .with_fetch(FetchMode::Unreliable),
                )
                .secondary_key(&["number"]),
        )
        .entity(
            TypeDescriptor::new("Site")
                .attribute(AttributeDescriptor::text("name"))
                .attribute(AttributeDescriptor::independent("contact", "Person", Cardinality::One))
                .secondary_key(&["name"]),
        )
        .entity(
            TypeDescriptor::new("Specimen")
                .attribute(AttributeDescriptor::text("barcode"))
                .attribute(AttributeDescriptor::text("label").autogenerated())
                .attribute(AttributeDescriptor::text("kind"))
                .secondary_key(&["barcode"]),
        )
        .entity(
            TypeDescriptor::new("Order")
                .attribute(AttributeDescriptor::text("number"))
                .attribute(AttributeDescriptor::dependents("items", "LineItem").with_inverse("order"))
                .secondary_key(&["number"]),
        )
        .entity(
            TypeDescriptor::new("LineItem")
                .attribute(AttributeDescriptor::text("sku"))
                .attribute(AttributeDescriptor::int("quantity"))
                .attribute(AttributeDescriptor::owner("order", "Order").with_inverse("items"))
                .secondary_key(&["sku", "order"]),
        )
        .entity(
            TypeDescriptor::new("Consent")
                .attribute(AttributeDescriptor::text("topic"))
                .attribute(AttributeDescriptor::boolean("granted"))
                .attribute(AttributeDescriptor::owner("person", "Person").with_inverse("consents"))
                .secondary_key(&["topic", "person"])
                .proxied_by("ConsentEvent", "consent"),
        )
        .entity(
            TypeDescriptor::new("ConsentEvent")
                .attribute(AttributeDescriptor::text("note"))
                .attribute(
                    AttributeDescriptor::reference("consent", "Consent", Cardinality::One, Role::Independent)
                        .cascaded()
                        .cascade_update(),
                ),
        )
        .build()
        .expect("fixture registry is valid");
    Rc::new(registry)
}

fn instance(registry: &Registry, type_name: &str) -> EntityRef {
    registry.instantiate(type_name).expect("fixture type is registered")
}

pub(crate) fn person(registry: &Registry, name: &str) -> EntityRef {
    let p = instance(registry, "Person");
    p.set("name", name).unwrap();
    p
}

pub(crate) fn address(registry: &Registry, kind: &str, street: &str) -> EntityRef {
    let a = instance(registry, "Address");
    a.set("kind", kind).unwrap();
    a.set("street", street).unwrap();
    a
}

pub(crate) fn site(registry: &Registry, name: &str) -> EntityRef {
    let s = instance(registry, "Site");
    s.set("name", name).unwrap();
    s
}

pub(crate) fn account(registry: &Registry, number: &str) -> EntityRef {
    let a = instance(registry, "Account");
    a.set("number", number).unwrap();
    a
}

pub(crate) fn specimen(registry: &Registry, barcode: &str) -> EntityRef {
    let s = instance(registry, "Specimen");
    s.set("barcode", barcode).unwrap();
    s
}

pub(crate) fn order(registry: &Registry, number: &str) -> EntityRef {
    let o = instance(registry, "Order");
    o.set("number", number).unwrap();
    o
}

pub(crate) fn line_item(registry: &Registry, sku: &str, quantity: i64) -> EntityRef {
    let item = instance(registry, "LineItem");
    item.set("sku", sku).unwrap();
    item.set("quantity", quantity).unwrap();
    item
}

pub(crate) fn consent(registry: &Registry, topic: &str, granted: bool) -> EntityRef {
    let c = instance(registry, "Consent");
    c.set("topic", topic).unwrap();
    c.set("granted", granted).unwrap();
    c
}

/// A mediator over an in-memory service, with direct access to both.
pub(crate) struct Harness {
    pub(crate) db: Database,
    pub(crate) service: Rc<InMemoryService>,
    pub(crate) registry: Rc<Registry>,
}

impl Harness {
    pub(crate) fn remote(&self) -> Rc<dyn RemoteService> {
        self.service.clone()
    }

    /// Store `entity` on the service behind the mediator's back and give it
    /// the assigned identifier.
    pub(crate) fn seed(&self, entity: &EntityRef) -> Identifier {
        let id = self.service.seed(entity).expect("fixture entity can be seeded");
        entity.set_identifier(Some(id));
        id
    }
}

/// Formatted log output collected in memory.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `body` with a thread-local subscriber and return its result with
/// the lines it logged at `level` or above.
pub(crate) fn logged<T>(level: tracing::Level, body: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, body);
    let text = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (result, text)
}

pub(crate) fn logged_errors<T>(body: impl FnOnce() -> T) -> (T, String) {
    logged(tracing::Level::ERROR, body)
}

pub(crate) fn harness() -> Harness {
    harness_with(ServiceOptions::default(), MediatorConfig::default())
}

pub(crate) fn harness_with(options: ServiceOptions, config: MediatorConfig) -> Harness {
    let registry = registry();
    let service = Rc::new(InMemoryService::with_options(Rc::clone(&registry), options));
    let remote: Rc<dyn RemoteService> = service.clone();
    let db = Database::with_config(Rc::clone(&registry), remote, config).expect("fixture config is valid");
    Harness { db, service, registry }
}

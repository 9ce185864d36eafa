//! Translation between local objects and remote records.
//!
//! The mapper walks the entity's [`EntitySchema`]: declared attributes are
//! copied by name and declared to-one relationships are translated between
//! [`LocalRef`]s and [`RecordId`]s. Fields present on one side but not
//! declared in the schema are left alone. To-many relationships are never
//! mapped.

use crate::local::{LocalObject, LocalRef};
use crate::schema::{EntitySchema, SchemaRegistry};
use std::collections::BTreeMap;
use tracing::warn;
use zonesync_record::{RecordId, RemoteRecord};

/// A record built from a local object.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    /// The record to save.
    pub record: RemoteRecord,
    /// Related objects that have no remote id yet. Their reference fields
    /// were left out of `record`.
    pub unresolved_targets: Vec<LocalRef>,
}

impl MappedRecord {
    /// Returns true if every relationship was resolved.
    pub fn is_complete(&self) -> bool {
        self.unresolved_targets.is_empty()
    }
}

/// Result of applying a record to a local object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Reference fields whose target has no local object yet.
    pub unresolved: BTreeMap<String, RecordId>,
}

impl ApplyOutcome {
    /// Returns true if every reference was linked.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Schema-driven record mapper.
#[derive(Debug, Clone, Copy)]
pub struct RecordMapper<'a> {
    schema: &'a SchemaRegistry,
}

impl<'a> RecordMapper<'a> {
    /// Creates a mapper over `schema`.
    pub fn new(schema: &'a SchemaRegistry) -> Self {
        Self { schema }
    }

    fn entity(&self, name: &str) -> Option<&'a EntitySchema> {
        let entity = self.schema.entity(name);
        if entity.is_none() {
            warn!(entity = %name, "no schema for entity type");
        }
        entity
    }

    /// Writes `object` onto `base`.
    ///
    /// `base` is either a fresh record or the server copy, whose change tag
    /// is kept. `resolve` maps a related object to its remote id.
    pub fn to_remote(
        &self,
        object: &LocalObject,
        mut base: RemoteRecord,
        resolve: impl Fn(LocalRef) -> Option<RecordId>,
    ) -> MappedRecord {
        let mut unresolved_targets = Vec::new();
        let Some(entity) = self.entity(object.entity()) else {
            return MappedRecord {
                record: base,
                unresolved_targets,
            };
        };

        for attribute in entity.attributes() {
            match object.get(&attribute.name) {
                Some(value) => {
                    base.fields.insert(attribute.name.clone(), value.clone());
                }
                None => {
                    base.fields.remove(&attribute.name);
                }
            }
        }

        for relationship in entity.to_one_relationships() {
            let name = &relationship.name;
            match object.relation(name) {
                Some(target) => match resolve(target) {
                    Some(remote_id) => {
                        base.references.insert(name.clone(), remote_id);
                    }
                    None => {
                        base.references.remove(name);
                        unresolved_targets.push(target);
                    }
                },
                None => {
                    base.references.remove(name);
                }
            }
        }

        MappedRecord {
            record: base,
            unresolved_targets,
        }
    }

    /// Copies `record` into `object`.
    ///
    /// Declared attributes missing from the record are cleared. A reference
    /// whose target `lookup` cannot find leaves the relation unset and is
    /// reported in the outcome.
    pub fn apply_to_local(
        &self,
        object: &mut LocalObject,
        record: &RemoteRecord,
        lookup: impl Fn(&RecordId) -> Option<LocalRef>,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let Some(entity) = self.entity(object.entity()) else {
            return outcome;
        };

        for attribute in entity.attributes() {
            match record.field(&attribute.name) {
                Some(value) if value.is_null() || value.kind() == attribute.kind => {
                    object.set(attribute.name.clone(), value.clone());
                }
                Some(value) => {
                    warn!(
                        record_id = %record.record_id,
                        field = %attribute.name,
                        expected = ?attribute.kind,
                        actual = ?value.kind(),
                        "ignoring field with mismatched kind"
                    );
                }
                None => object.clear(&attribute.name),
            }
        }

        for relationship in entity.to_one_relationships() {
            let name = &relationship.name;
            match record.reference(name) {
                Some(target_id) => match lookup(target_id) {
                    Some(target) => object.link(name.clone(), target),
                    None => {
                        object.unlink(name);
                        outcome.unresolved.insert(name.clone(), target_id.clone());
                    }
                },
                None => object.unlink(name),
            }
        }

        outcome
    }
}

//! Statically declared entity schemas.
//!
//! Each entity type is described once at startup by an [`EntitySchema`];
//! the record mapper walks these descriptors instead of inspecting objects.

use std::collections::BTreeMap;
use zonesync_record::FieldKind;

/// A scalar attribute of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    /// Attribute name.
    pub name: String,
    /// Value kind.
    pub kind: FieldKind,
}

/// Cardinality of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Single-valued reference.
    ToOne,
    /// Collection; never synchronized.
    ToMany,
}

/// A relationship from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    /// Relationship name.
    pub name: String,
    /// Target entity name.
    pub target: String,
    /// Cardinality.
    pub cardinality: Cardinality,
}

/// Descriptor of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    name: String,
    attributes: Vec<AttributeDescriptor>,
    relationships: Vec<RelationshipDescriptor>,
}

impl EntitySchema {
    /// Starts a descriptor for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Adds a scalar attribute.
    pub fn attribute(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.attributes.push(AttributeDescriptor {
            name: name.into(),
            kind,
        });
        self
    }

    /// Adds a single-valued relationship.
    pub fn to_one(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relationship(name, target, Cardinality::ToOne)
    }

    /// Adds a to-many relationship.
    pub fn to_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relationship(name, target, Cardinality::ToMany)
    }

    fn relationship(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        self.relationships.push(RelationshipDescriptor {
            name: name.into(),
            target: target.into(),
            cardinality,
        });
        self
    }

    /// Entity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared attributes, in declaration order.
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    /// Declared kind of an attribute.
    pub fn attribute_kind(&self, name: &str) -> Option<FieldKind> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.kind)
    }

    /// All declared relationships.
    pub fn relationships(&self) -> &[RelationshipDescriptor] {
        &self.relationships
    }

    /// Single-valued relationships only.
    pub fn to_one_relationships(&self) -> impl Iterator<Item = &RelationshipDescriptor> {
        self.relationships
            .iter()
            .filter(|r| r.cardinality == Cardinality::ToOne)
    }
}

/// The set of entity types known to a local store.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    /// Builds a registry. Later descriptors replace earlier ones of the same name.
    pub fn new(entities: Vec<EntitySchema>) -> Self {
        Self {
            entities: entities
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect(),
        }
    }

    /// Looks up an entity descriptor.
    pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.get(name)
    }

    /// Returns true if the entity type is known.
    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Names of all known entity types, sorted.
    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

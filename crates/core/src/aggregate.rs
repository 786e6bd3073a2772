//! Aggregate root trait for parent entities that own child collections.

use crate::entity::Entity;

/// Aggregate root: an entity that exclusively owns its children.
///
/// Children never outlive their root and are never reassigned to another root.
/// Storage may hand out a root without its children (lazy reads), so callers
/// must be able to tell "no children" apart from "children not read".
pub trait AggregateRoot: Entity {
    /// Returns `true` when every owned child collection was read from storage.
    fn children_loaded(&self) -> bool;
}

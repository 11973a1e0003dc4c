//! Core entity trait that all cached entities must implement.

use serde::Serialize;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Trait that all entities held by the cache must implement.
///
/// The lifecycle hooks are optional capabilities: an entity that does not
/// care about them keeps the no-op defaults.
///
/// # Example
///
/// ```
/// use serde::Serialize;
/// use dbcache::Entity;
///
/// #[derive(Clone, Serialize)]
/// pub struct Account {
///     pub id: Option<u64>,
///     pub owner: String,
/// }
///
/// impl Entity for Account {
///     type Id = u64;
///
///     fn id(&self) -> Option<Self::Id> {
///         self.id
///     }
///
///     fn set_id(&mut self, id: Self::Id) {
///         self.id = Some(id);
///     }
///
///     fn entity_name() -> &'static str {
///         "account"
///     }
/// }
/// ```
pub trait Entity: Serialize + Send + Sync + 'static {
    /// Primary key type.
    ///
    /// `Ord` gives secondary-index id sets a stable order for pagination.
    type Id: Display + Debug + Clone + Eq + Hash + Ord + Send + Sync + 'static;

    /// Return the primary key, or `None` for a new entity awaiting generation.
    fn id(&self) -> Option<Self::Id>;

    /// Assign a generated primary key.
    fn set_id(&mut self, id: Self::Id);

    /// Entity type name, used in logs and stats.
    fn entity_name() -> &'static str;

    /// Optional: called once after the entity is loaded from the database.
    fn after_load(&mut self) {}

    /// Optional: called right before the entity is written to the database.
    fn before_persist(&mut self) {}
}

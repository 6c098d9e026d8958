use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// A foreign key declared by an entity: `field` holds the id of a row of
/// kind `target`. Backends enforce it as a referential constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub field: &'static str,
    pub target: &'static str,
}

impl Reference {
    pub const fn new(field: &'static str, target: &'static str) -> Self {
        Self { field, target }
    }
}

/// Trait representing a persisted entity.
///
/// Entities are stored as JSON documents; the serde representation is the
/// persisted shape. Fields listed in [`navigations`](Entity::navigations)
/// hold eagerly-loaded relations: they are stripped before persisting and
/// never take part in change detection, so they should be
/// `#[serde(default)]`.
///
/// # Example
///
/// ```ignore
/// impl Entity for Order {
///     fn table_name() -> &'static str { "orders" }
///     fn id(&self) -> Uuid { self.id }
///     fn navigations() -> &'static [&'static str] { &["user"] }
///     fn references() -> &'static [Reference] {
///         const REFS: &[Reference] = &[Reference::new("user_id", "users")];
///         REFS
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + Unpin + 'static {
    fn table_name() -> &'static str;

    fn id(&self) -> Uuid;

    /// Name used in cache keys and diagnostics. Defaults to the type name
    /// without its module path.
    fn entity_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    fn id_column() -> &'static str {
        "id"
    }

    fn navigations() -> &'static [&'static str] {
        &[]
    }

    fn references() -> &'static [Reference] {
        &[]
    }
}

/// Serialize an entity into its persisted document body, without navigation
/// fields.
pub(crate) fn to_body<T: Entity>(entity: &T) -> Result<serde_json::Map<String, serde_json::Value>, crate::DataError> {
    match serde_json::to_value(entity)? {
        serde_json::Value::Object(mut map) => {
            for nav in T::navigations() {
                map.remove(*nav);
            }
            Ok(map)
        }
        other => Err(crate::DataError::Other(format!(
            "{} must serialize to a JSON object, got {other}",
            T::entity_name()
        ))),
    }
}

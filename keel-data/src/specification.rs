use std::fmt;

use crate::entity::Entity;
use crate::error::DataError;
use crate::include::{IncludePath, IncludeTree, Navigation};
use crate::query::{Expr, Field, Filter, SortKey};

/// A composable description of which entities to fetch: a filter tree, an
/// ordering chain and a tree of eager-load directives.
///
/// Building a specification never touches the store.
///
/// # Example
///
/// ```ignore
/// let mut spec = users.create_specification();
/// spec.and(User::ACTIVE.eq(true))
///     .or(User::NAME.like("adm%"))
///     .order_by(User::NAME)?
///     .then_by(User::CREATED_AT)?
///     .include(User::ORDERS)
///     .then_include(Order::LINES)?;
/// let page = users.get_paged(&spec, 1, 20).await?;
/// ```
pub struct Specification<T> {
    filter: Option<Filter<T>>,
    ordering: Vec<SortKey>,
    includes: IncludeTree,
}

impl<T: Entity> Specification<T> {
    pub fn new() -> Self {
        Self {
            filter: None,
            ordering: Vec::new(),
            includes: IncludeTree::new(),
        }
    }

    /// Conjoin `predicate` with the current filter, or set it if there is
    /// none.
    pub fn and(&mut self, predicate: impl Into<Filter<T>>) -> &mut Self {
        let predicate = predicate.into();
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Disjoin `predicate` with the current filter, or set it if there is
    /// none.
    pub fn or(&mut self, predicate: impl Into<Filter<T>>) -> &mut Self {
        let predicate = predicate.into();
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.or(predicate),
            None => predicate,
        });
        self
    }

    pub fn order_by(&mut self, key: Field<T>) -> Result<&mut Self, DataError> {
        self.set_primary(SortKey::ascending(key.name()))
    }

    pub fn order_by_descending(&mut self, key: Field<T>) -> Result<&mut Self, DataError> {
        self.set_primary(SortKey::descending(key.name()))
    }

    pub fn then_by(&mut self, key: Field<T>) -> Result<&mut Self, DataError> {
        self.push_secondary(SortKey::ascending(key.name()))
    }

    pub fn then_by_descending(&mut self, key: Field<T>) -> Result<&mut Self, DataError> {
        self.push_secondary(SortKey::descending(key.name()))
    }

    fn set_primary(&mut self, key: SortKey) -> Result<&mut Self, DataError> {
        if !self.ordering.is_empty() {
            return Err(DataError::invalid_state(
                "order_by is already set, use then_by for additional sorting",
            ));
        }
        self.ordering.push(key);
        Ok(self)
    }

    fn push_secondary(&mut self, key: SortKey) -> Result<&mut Self, DataError> {
        if self.ordering.is_empty() {
            return Err(DataError::invalid_state(
                "order_by must be set before then_by",
            ));
        }
        self.ordering.push(key);
        Ok(self)
    }

    /// Eagerly load `navigation` alongside the primary result.
    pub fn include<P: Entity>(&mut self, navigation: Navigation<T, P>) -> &mut Self {
        self.includes.push_root(IncludePath::of(navigation));
        self
    }

    /// Attach a nested include under the most recently added include.
    pub fn then_include<P: Entity, Q: Entity>(
        &mut self,
        navigation: Navigation<P, Q>,
    ) -> Result<&mut Self, DataError> {
        self.includes.push_child(IncludePath::of(navigation))?;
        Ok(self)
    }

    /// Reset filter, ordering and includes.
    pub fn clear(&mut self) {
        self.filter = None;
        self.ordering.clear();
        self.includes.clear();
    }

    pub fn filter(&self) -> Option<&Filter<T>> {
        self.filter.as_ref()
    }

    pub(crate) fn filter_expr(&self) -> Option<Expr> {
        self.filter.as_ref().map(|f| f.expr().clone())
    }

    pub fn ordering(&self) -> &[SortKey] {
        &self.ordering
    }

    pub fn has_ordering(&self) -> bool {
        !self.ordering.is_empty()
    }

    pub fn includes(&self) -> &IncludeTree {
        &self.includes
    }

    /// Evaluate the filter against an entity. No filter matches everything.
    pub fn matches(&self, entity: &T) -> Result<bool, DataError> {
        match &self.filter {
            Some(filter) => filter.matches(entity),
            None => Ok(true),
        }
    }
}

impl<T: Entity> Default for Specification<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Specification<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            ordering: self.ordering.clone(),
            includes: self.includes.clone(),
        }
    }
}

impl<T> fmt::Debug for Specification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specification")
            .field("filter", &self.filter)
            .field("ordering", &self.ordering)
            .field("includes", &self.includes.paths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Item {
        id: Uuid,
        name: String,
        price: i64,
        active: bool,
        #[serde(default)]
        tags: Vec<Tag>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tag {
        id: Uuid,
        item_id: Uuid,
    }

    impl Entity for Item {
        fn table_name() -> &'static str {
            "items"
        }
        fn id(&self) -> Uuid {
            self.id
        }
        fn navigations() -> &'static [&'static str] {
            &["tags"]
        }
    }

    impl Entity for Tag {
        fn table_name() -> &'static str {
            "tags"
        }
        fn id(&self) -> Uuid {
            self.id
        }
    }

    const NAME: Field<Item> = Field::new("name");
    const PRICE: Field<Item> = Field::new("price");
    const ACTIVE: Field<Item> = Field::new("active");
    const TAGS: Navigation<Item, Tag> = Navigation::collection("tags", "item_id");
    const TAG_ITEM: Navigation<Tag, Item> = Navigation::reference("item", "item_id");

    fn item(name: &str, price: i64, active: bool) -> Item {
        Item {
            id: Uuid::new_v4(),
            name: name.into(),
            price,
            active,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_and_requires_every_predicate() {
        let mut spec = Specification::<Item>::new();
        spec.and(PRICE.gt(10)).and(ACTIVE.eq(true));

        assert!(spec.matches(&item("a", 20, true)).unwrap());
        assert!(!spec.matches(&item("b", 5, true)).unwrap());
        assert!(!spec.matches(&item("c", 20, false)).unwrap());
    }

    #[test]
    fn test_or_builds_tree_in_call_order() {
        let mut spec = Specification::<Item>::new();
        spec.and(PRICE.gt(10)).or(NAME.eq("free"));

        assert_eq!(
            spec.filter().unwrap().to_string(),
            r#"(price > 10 OR name = "free")"#
        );
        assert!(spec.matches(&item("free", 0, false)).unwrap());
        assert!(!spec.matches(&item("cheap", 1, false)).unwrap());
    }

    #[test]
    fn test_or_is_de_morgan_consistent_with_and() {
        let mut any = Specification::<Item>::new();
        any.or(PRICE.gt(10)).or(ACTIVE.eq(true));
        let mut neither = Specification::<Item>::new();
        neither.and(PRICE.gt(10).not()).and(ACTIVE.eq(true).not());

        for candidate in [item("a", 20, true), item("b", 1, true), item("c", 1, false)] {
            assert_eq!(
                any.matches(&candidate).unwrap(),
                !neither.matches(&candidate).unwrap()
            );
        }
    }

    #[test]
    fn test_empty_spec_matches_everything() {
        let spec = Specification::<Item>::new();
        assert!(spec.matches(&item("x", 0, false)).unwrap());
    }

    #[test]
    fn test_then_by_without_order_by_fails() {
        let mut spec = Specification::<Item>::new();
        assert!(matches!(spec.then_by(NAME), Err(DataError::InvalidState(_))));
    }

    #[test]
    fn test_order_by_twice_fails() {
        let mut spec = Specification::<Item>::new();
        spec.order_by(NAME).unwrap();
        assert!(matches!(
            spec.order_by_descending(PRICE),
            Err(DataError::InvalidState(_))
        ));
    }

    #[test]
    fn test_ordering_chain() {
        let mut spec = Specification::<Item>::new();
        spec.order_by(NAME).unwrap().then_by_descending(PRICE).unwrap();
        let keys: Vec<String> = spec.ordering().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["name ASC", "price DESC"]);
    }

    #[test]
    fn test_then_include_without_include_fails() {
        let mut spec = Specification::<Item>::new();
        assert!(matches!(
            spec.then_include(TAG_ITEM),
            Err(DataError::InvalidState(_))
        ));
    }

    #[test]
    fn test_then_include_nests_under_last_include() {
        let mut spec = Specification::<Item>::new();
        spec.include(TAGS).then_include(TAG_ITEM).unwrap();
        assert_eq!(spec.includes().paths(), vec!["tags", "tags.item"]);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut spec = Specification::<Item>::new();
        spec.and(ACTIVE.eq(true)).include(TAGS);
        spec.order_by(NAME).unwrap();

        spec.clear();

        assert!(spec.filter().is_none());
        assert!(!spec.has_ordering());
        assert!(spec.includes().is_empty());
        assert!(spec.then_by(PRICE).is_err());
        assert!(spec.order_by(PRICE).is_ok());
        assert!(spec.then_by(NAME).is_ok());
    }
}

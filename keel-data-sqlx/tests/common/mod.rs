#![allow(dead_code)]

use keel_data::prelude::*;
use keel_data_sqlx::{SqliteConfig, SqliteStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: Uuid,
    pub name: String,
    pub country: String,
    pub born: i64,
    #[serde(default)]
    pub books: Vec<Book>,
}

impl Author {
    pub const NAME: Field<Author> = Field::new("name");
    pub const COUNTRY: Field<Author> = Field::new("country");
    pub const BORN: Field<Author> = Field::new("born");
    pub const BOOKS: Navigation<Author, Book> = Navigation::collection("books", "author_id");

    pub fn new(name: &str, country: &str, born: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            country: country.to_string(),
            born,
            books: Vec::new(),
        }
    }
}

impl Entity for Author {
    fn table_name() -> &'static str {
        "authors"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn navigations() -> &'static [&'static str] {
        &["books"]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: Uuid,
    pub author_id: Uuid,
    pub title: String,
    pub pages: i64,
    #[serde(default)]
    pub author: Option<Author>,
}

impl Book {
    pub const TITLE: Field<Book> = Field::new("title");
    pub const PAGES: Field<Book> = Field::new("pages");
    pub const AUTHOR: Navigation<Book, Author> = Navigation::reference("author", "author_id");

    pub fn new(author_id: Uuid, title: &str, pages: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_id,
            title: title.to_string(),
            pages,
            author: None,
        }
    }
}

impl Entity for Book {
    fn table_name() -> &'static str {
        "books"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn navigations() -> &'static [&'static str] {
        &["author"]
    }

    fn references() -> &'static [Reference] {
        const REFS: &[Reference] = &[Reference::new("author_id", "authors")];
        REFS
    }
}

pub async fn memory_store() -> SqliteStore {
    SqliteStore::connect(&SqliteConfig::default()).await.unwrap()
}

pub fn context(store: &SqliteStore) -> Arc<DbContext<SqliteStore>> {
    DbContext::new(store.clone()).into_shared()
}

pub async fn seed(store: &SqliteStore, authors: &[Author]) {
    let repo = Repository::<Author, _>::new(context(store));
    for author in authors {
        repo.add(author.clone()).unwrap();
    }
    assert!(repo.save().await.unwrap().succeeded());
}

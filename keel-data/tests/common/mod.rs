#![allow(dead_code)]

use keel_data::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub age: i64,
    #[serde(default)]
    pub orders: Vec<Order>,
}

impl Customer {
    pub const NAME: Field<Customer> = Field::new("name");
    pub const CITY: Field<Customer> = Field::new("city");
    pub const AGE: Field<Customer> = Field::new("age");
    pub const ORDERS: Navigation<Customer, Order> = Navigation::collection("orders", "customer_id");

    pub fn new(name: &str, city: &str, age: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            city: city.to_string(),
            age,
            orders: Vec::new(),
        }
    }
}

impl Entity for Customer {
    fn table_name() -> &'static str {
        "customers"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn navigations() -> &'static [&'static str] {
        &["orders"]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub total: i64,
    #[serde(default)]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
}

impl Order {
    pub const TOTAL: Field<Order> = Field::new("total");
    pub const CUSTOMER: Navigation<Order, Customer> = Navigation::reference("customer", "customer_id");
    pub const LINES: Navigation<Order, OrderLine> = Navigation::collection("lines", "order_id");

    pub fn new(customer_id: Uuid, total: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            total,
            customer: None,
            lines: Vec::new(),
        }
    }
}

impl Entity for Order {
    fn table_name() -> &'static str {
        "orders"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn navigations() -> &'static [&'static str] {
        &["customer", "lines"]
    }

    fn references() -> &'static [Reference] {
        const REFS: &[Reference] = &[Reference::new("customer_id", "customers")];
        REFS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub sku: String,
}

impl OrderLine {
    pub fn new(order_id: Uuid, sku: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            sku: sku.to_string(),
        }
    }
}

impl Entity for OrderLine {
    fn table_name() -> &'static str {
        "order_lines"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn references() -> &'static [Reference] {
        const REFS: &[Reference] = &[Reference::new("order_id", "orders")];
        REFS
    }
}

pub fn context(store: &MemoryStore) -> Arc<DbContext<MemoryStore>> {
    DbContext::new(store.clone()).into_shared()
}

/// Persist `customers` through a throwaway context.
pub async fn seed(store: &MemoryStore, customers: &[Customer]) {
    let repo = Repository::<Customer, _>::new(context(store));
    for customer in customers {
        repo.add(customer.clone()).unwrap();
    }
    assert!(repo.save().await.unwrap().succeeded());
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

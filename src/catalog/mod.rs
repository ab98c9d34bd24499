//! Catalog Seeder
//!
//! Deterministic sample data (categories and products) and the store
//! workflows built on it: seed, index, report.
//!
//! Generation is pure; only the workflows touch a connection.

use bson::Document;
use serde::{Deserialize, Serialize};

use crate::connection::{CommandReply, Connection};
use crate::error::{DocpoolError, Result};
use crate::executor::{self, IndexSpec};

/// Default database of the store workflows
pub const STORE_DATABASE: &str = "store";
pub const CATEGORIES_COLLECTION: &str = "categories";
pub const PRODUCTS_COLLECTION: &str = "products";

pub const CATEGORY_COUNT: usize = 10;
pub const PRODUCT_COUNT: usize = 1000;

/// Price of a category-0 product; each category adds 100
pub const BASE_PRICE: f64 = 999.99;

/// Category and price ceiling used by [`product_report`]
pub const REPORT_CATEGORY: i32 = 5;
pub const REPORT_PRICE_CEILING: f64 = 1200.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    #[serde(rename = "_id")]
    pub id: i32,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "_id")]
    pub id: i32,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub category_id: i32,
}

impl CategoryRecord {
    pub fn to_document(&self) -> Result<Document> {
        Ok(bson::to_document(self)?)
    }
}

impl ProductRecord {
    pub fn to_document(&self) -> Result<Document> {
        Ok(bson::to_document(self)?)
    }
}

/// Categories `0..n`, labelled from 1
pub fn generate_categories(n: usize) -> Result<Vec<CategoryRecord>> {
    let n = record_count(n)?;
    Ok((0..n)
        .map(|id| CategoryRecord {
            id,
            name: format!("Category #{}", id + 1),
            description: format!("Category #{} description", id + 1),
        })
        .collect())
}

/// Products `1..=n`
pub fn generate_products(n: usize) -> Result<Vec<ProductRecord>> {
    let n = record_count(n)?;
    Ok((1..=n)
        .map(|id| {
            let category_id = category_for(id);
            ProductRecord {
                id,
                name: format!("Product #{id}"),
                description: format!("Product #{id} awesome description"),
                price: price_for(category_id),
                category_id,
            }
        })
        .collect())
}

fn record_count(n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| {
        DocpoolError::invalid_input(format!("cannot generate {n} records: ids are 32-bit"))
    })
}

/// Category of product `id`: `id mod 10`, with 0 folded into 1
#[must_use]
pub const fn category_for(id: i32) -> i32 {
    match id % 10 {
        0 => 1,
        category => category,
    }
}

#[must_use]
pub fn price_for(category_id: i32) -> f64 {
    BASE_PRICE + f64::from(category_id) * 100.0
}

/// Counts written by [`seed_store`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSummary {
    pub categories: u64,
    pub products: u64,
}

/// Insert the standard categories and products into `database`
pub async fn seed_store(connection: &mut Connection, database: &str) -> Result<SeedSummary> {
    let categories = generate_categories(CATEGORY_COUNT)?
        .iter()
        .map(CategoryRecord::to_document)
        .collect::<Result<Vec<_>>>()?;
    let products = generate_products(PRODUCT_COUNT)?
        .iter()
        .map(ProductRecord::to_document)
        .collect::<Result<Vec<_>>>()?;

    let categories =
        executor::insert_many(connection, database, CATEGORIES_COLLECTION, &categories).await?;
    let products =
        executor::insert_many(connection, database, PRODUCTS_COLLECTION, &products).await?;
    Ok(SeedSummary { categories, products })
}

/// Ascending indexes on `price` and `category_id`
#[must_use]
pub fn product_indexes() -> [IndexSpec; 2] {
    [IndexSpec::ascending("price"), IndexSpec::ascending("category_id")]
}

pub async fn index_products(connection: &mut Connection, database: &str) -> Result<CommandReply> {
    executor::create_indexes(connection, database, PRODUCTS_COLLECTION, &product_indexes()).await
}

/// Product counts by category and by price ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductReport {
    pub category_id: i32,
    pub in_category: u64,
    pub price_ceiling: f64,
    pub at_or_below_price: u64,
}

pub async fn product_report(connection: &mut Connection, database: &str) -> Result<ProductReport> {
    let in_category = executor::count_where(
        connection,
        database,
        PRODUCTS_COLLECTION,
        Some(bson::doc! { "category_id": REPORT_CATEGORY }),
    )
    .await?;
    let at_or_below_price = executor::count_where(
        connection,
        database,
        PRODUCTS_COLLECTION,
        Some(bson::doc! { "price": { "$lte": REPORT_PRICE_CEILING } }),
    )
    .await?;

    Ok(ProductReport {
        category_id: REPORT_CATEGORY,
        in_category,
        price_ceiling: REPORT_PRICE_CEILING,
        at_or_below_price,
    })
}

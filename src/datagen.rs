//! Synthetic marketplace data
//!
//! Writes a reproducible `daily_product_sales.csv`: products with a random
//! category and price, orders spread over one year, aggregated per product
//! and day.

use crate::error::{ConfigError, Result};
use crate::llm::offline::CATEGORIES;
use crate::schema::DEFAULT_TABLE;
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct SeedOptions {
    pub seed: u64,
    pub products: usize,
    pub orders: usize,
    pub year: i32,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            seed: 7,
            products: 500,
            orders: 20_000,
            year: 2024,
        }
    }
}

#[derive(Debug, Serialize)]
struct SalesRow<'a> {
    product_title: &'a str,
    category: &'a str,
    day: String,
    units: u32,
    revenue: f64,
}

struct Product {
    title: String,
    category: &'static str,
    price: f64,
}

/// Generate the table into `data_dir`, returning the file path and row count.
pub fn write_daily_product_sales(data_dir: &Path, options: &SeedOptions) -> Result<(PathBuf, usize)> {
    std::fs::create_dir_all(data_dir)?;
    let mut rng = StdRng::seed_from_u64(options.seed);

    let products: Vec<Product> = (1..=options.products.max(1))
        .map(|i| {
            // roughly gamma-shaped: sum of a few uniforms, skewed right
            let price: f64 = 5.0 + (0..4).map(|_| rng.gen_range(0.0..40.0)).sum::<f64>();
            Product {
                title: format!("Product {}", i),
                category: CATEGORIES[rng.gen_range(0..CATEGORIES.len())],
                price: (price * 100.0).round() / 100.0,
            }
        })
        .collect();

    let start = NaiveDate::from_ymd_opt(options.year, 1, 1).ok_or_else(|| ConfigError::InvalidValue {
        key: "year".to_string(),
        value: options.year.to_string(),
        reason: "not a representable calendar year".to_string(),
    })?;
    let days_in_year = if NaiveDate::from_ymd_opt(options.year, 2, 29).is_some() { 366 } else { 365 };

    // (day offset, product index) -> units
    let mut totals: BTreeMap<(i64, usize), u32> = BTreeMap::new();
    for _ in 0..options.orders {
        let product = rng.gen_range(0..products.len());
        let qty = rng.gen_range(1..4);
        let day = rng.gen_range(0..days_in_year);
        *totals.entry((day, product)).or_insert(0) += qty;
    }

    let path = data_dir.join(format!("{}.csv", DEFAULT_TABLE));
    let mut writer = csv::Writer::from_path(&path).map_err(std::io::Error::from)?;
    for (&(day, idx), &units) in &totals {
        let product = &products[idx];
        writer
            .serialize(SalesRow {
                product_title: &product.title,
                category: product.category,
                day: (start + Duration::days(day)).format("%Y-%m-%d").to_string(),
                units,
                revenue: ((units as f64 * product.price) * 100.0).round() / 100.0,
            })
            .map_err(std::io::Error::from)?;
    }
    writer.flush()?;

    info!("Wrote {} rows to {}", totals.len(), path.display());
    Ok((path, totals.len()))
}

#![cfg(feature = "runtime")]

use anyhow::{Context, Result};
use sqlx::postgres::PgQueryResult;
use tracing::info;

use crate::catalog::ReferenceCatalog;
use crate::db::DbPool;

/// Upserts the catalog's basins and indicators into the reference tables.
pub async fn seed_catalog(pool: &DbPool, catalog: &ReferenceCatalog) -> Result<()> {
    seed_basins(pool, catalog).await?;
    seed_indicators(pool, catalog).await?;
    Ok(())
}

async fn seed_basins(pool: &DbPool, catalog: &ReferenceCatalog) -> Result<()> {
    for basin in catalog.basins() {
        let geometry = basin
            .geometry
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .with_context(|| format!("failed to encode geometry for basin {}", basin.id))?;
        let result: PgQueryResult = sqlx::query::<sqlx::Postgres>(
            r#"
            INSERT INTO basin (basin_id, name, aliases, geometry, attributes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (basin_id)
            DO UPDATE SET
                name = EXCLUDED.name,
                aliases = EXCLUDED.aliases,
                geometry = EXCLUDED.geometry,
                attributes = EXCLUDED.attributes
            "#,
        )
        .bind(&basin.id)
        .bind(&basin.name)
        .bind(&basin.aliases)
        .bind(geometry)
        .bind(serde_json::to_value(&basin.attributes)?)
        .execute(pool)
        .await
        .with_context(|| format!("failed to seed basin {}", basin.id))?;

        if result.rows_affected() > 0 {
            info!(basin = %basin.id, "Seeded basin");
        }
    }
    Ok(())
}

async fn seed_indicators(pool: &DbPool, catalog: &ReferenceCatalog) -> Result<()> {
    for indicator in catalog.indicators() {
        let derivation = indicator
            .derivation
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let result: PgQueryResult = sqlx::query::<sqlx::Postgres>(
            r#"
            INSERT INTO indicator_definition (
                indicator_id, name, unit, aggregation, valid_min, valid_max,
                derivation, temporal_resolution, category
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (indicator_id)
            DO UPDATE SET
                name = EXCLUDED.name,
                unit = EXCLUDED.unit,
                aggregation = EXCLUDED.aggregation,
                valid_min = EXCLUDED.valid_min,
                valid_max = EXCLUDED.valid_max,
                derivation = EXCLUDED.derivation,
                temporal_resolution = EXCLUDED.temporal_resolution,
                category = EXCLUDED.category
            "#,
        )
        .bind(&indicator.id)
        .bind(&indicator.name)
        .bind(&indicator.unit)
        .bind(indicator.aggregation.as_str())
        .bind(indicator.valid_range.min)
        .bind(indicator.valid_range.max)
        .bind(derivation)
        .bind(indicator.temporal_resolution.as_deref())
        .bind(indicator.category.as_deref())
        .execute(pool)
        .await
        .with_context(|| format!("failed to seed indicator {}", indicator.id))?;

        if result.rows_affected() > 0 {
            info!(indicator = %indicator.id, derived = indicator.is_derived(), "Seeded indicator");
        }
    }
    Ok(())
}

//! Read-only provider of validation targets. The only trait in the core
//! pipeline that talks to the datastore directly — the rest of the
//! pipeline works over `Property` values already in memory.

use crate::error::ValidatorError;
use crate::model::Property;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[async_trait]
pub trait PropertySource: Send + Sync {
    async fn active_properties(&self) -> Result<Vec<Property>, ValidatorError>;
}

pub struct SqlitePropertySource {
    pool: SqlitePool,
}

impl SqlitePropertySource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertySource for SqlitePropertySource {
    async fn active_properties(&self) -> Result<Vec<Property>, ValidatorError> {
        let rows = sqlx::query(
            "SELECT id, displayName, targetUrl, expectedAnalyticsId, expectedTagManagerId, \
             usesConsentMode, slug FROM properties WHERE isActive = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let properties = rows
            .into_iter()
            .map(|row| Property {
                id: row.get("id"),
                display_name: row.get("displayName"),
                target_url: row.get("targetUrl"),
                expected_analytics_id: row.get("expectedAnalyticsId"),
                expected_tag_manager_id: row.get("expectedTagManagerId"),
                uses_consent_mode: row.get::<i64, _>("usesConsentMode") != 0,
                slug: row.get("slug"),
            })
            .collect();

        Ok(properties)
    }
}

/// Fixture-backed source used in tests and dry-run modes (no `sqlx` pool
/// required).
pub struct StaticPropertySource {
    properties: Vec<Property>,
}

impl StaticPropertySource {
    pub fn new(properties: Vec<Property>) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl PropertySource for StaticPropertySource {
    async fn active_properties(&self) -> Result<Vec<Property>, ValidatorError> {
        Ok(self.properties.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_returns_configured_properties() {
        let property = Property {
            id: "p1".to_string(),
            display_name: "Example".to_string(),
            target_url: "https://example.com".to_string(),
            expected_analytics_id: Some("G-AAAA".to_string()),
            expected_tag_manager_id: None,
            uses_consent_mode: false,
            slug: "example".to_string(),
        };
        let source = StaticPropertySource::new(vec![property.clone()]);
        let properties = source.active_properties().await.unwrap();
        assert_eq!(properties, vec![property]);
    }
}

use super::*;

/// One eligible instance shape as persisted in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceShape {
    pub shape: String,
    pub cpus: i64,
    pub mem_mb: i64,
    pub storage_gb: i64,
}

impl Cache {
    pub async fn count_instance_types(&self) -> anyhow::Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM instance_types")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn insert_instance_type(&self, shape: &InstanceShape) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT OR REPLACE INTO instance_types (shape, cpus, mem_mb, storage_gb)
VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&shape.shape)
        .bind(shape.cpus)
        .bind(shape.mem_mb)
        .bind(shape.storage_gb)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_feature(&self, shape: &str, key: &str, value: f64) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO it_features (shape, key, value) VALUES (?, ?, ?)")
            .bind(shape)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn shape_names(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT shape FROM instance_types")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(shape,)| shape).collect())
    }

    /// Shapes satisfying the hard cpu/memory floor, with their bundled
    /// local storage.
    pub async fn shapes_matching(
        &self,
        cpus: i64,
        mem_mb: i64,
    ) -> anyhow::Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT shape, storage_gb FROM instance_types WHERE cpus >= ? AND mem_mb >= ?",
        )
        .bind(cpus)
        .bind(mem_mb)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn feature_keys(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT key FROM it_features")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    pub async fn shapes_with_feature_at_least(
        &self,
        key: &str,
        value: f64,
    ) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT shape FROM it_features WHERE key = ? AND value >= ?")
                .bind(key)
                .bind(value)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(shape,)| shape).collect())
    }

    /// Current quotes for one shape, excluding every zone in backoff.
    pub async fn quotes_for_shape(&self, shape: &str) -> anyhow::Result<Vec<(String, f64)>> {
        let rows: Vec<(String, f64)> =
            sqlx::query_as("SELECT az, price FROM spot_prices WHERE shape = ? AND backoff < 1")
                .bind(shape)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// A fresh quote clears any prior backoff.
    pub async fn upsert_quote(&self, shape: &str, az: &str, price: f64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO spot_prices (shape, az, price, backoff) VALUES (?, ?, ?, 0)",
        )
        .bind(shape)
        .bind(az)
        .bind(price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// In-place read-modify-write so concurrent observers each count.
    pub async fn increment_backoff(&self, shape: &str, az: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE spot_prices SET backoff = backoff + 1 WHERE shape = ? AND az = ?")
            .bind(shape)
            .bind(az)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn quote_backoff(&self, shape: &str, az: &str) -> anyhow::Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT backoff FROM spot_prices WHERE shape = ? AND az = ?")
                .bind(shape)
                .bind(az)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(backoff,)| backoff))
    }
}

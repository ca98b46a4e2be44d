use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

use super::{ChannelDirectory, DirectoryError, DirectoryResult};
use crate::models::{ChannelId, ChannelRecord, ChannelStatus, ScenarioId};

#[derive(Debug, FromRow)]
struct ChannelRow {
    id: String,
    name: String,
    stream_key: String,
    rtmp_url: Option<String>,
    status: String,
}

impl From<ChannelRow> for ChannelRecord {
    fn from(row: ChannelRow) -> Self {
        let status = ChannelStatus::parse(&row.status).unwrap_or_else(|| {
            tracing::warn!(channel_id = %row.id, status = %row.status, "Unknown channel status, treating as IDLE");
            ChannelStatus::Idle
        });
        ChannelRecord {
            id: ChannelId::new(row.id),
            name: row.name,
            stream_key: row.stream_key,
            rtmp_url: row.rtmp_url,
            status,
        }
    }
}

/// Directory over the `"Channel"` / `"Scenario"` tables
#[derive(Clone)]
pub struct PgChannelDirectory {
    pool: PgPool,
}

impl PgChannelDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelDirectory for PgChannelDirectory {
    async fn find_channel(&self, id: &ChannelId) -> DirectoryResult<Option<ChannelRecord>> {
        let row = sqlx::query_as::<_, ChannelRow>(
            r#"
            SELECT id, name, "streamKey" AS stream_key, "rtmpUrl" AS rtmp_url, status::text AS status
            FROM "Channel"
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ChannelRecord::from))
    }

    async fn active_scenario(&self, id: &ChannelId) -> DirectoryResult<Option<ScenarioId>> {
        let scenario: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM "Scenario"
            WHERE "channelId" = $1 AND "isActive" = TRUE
            LIMIT 1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(scenario.map(ScenarioId::new))
    }

    async fn channel_for_scenario(&self, id: &ScenarioId) -> DirectoryResult<Option<ChannelId>> {
        let channel: Option<String> =
            sqlx::query_scalar(r#"SELECT "channelId" FROM "Scenario" WHERE id = $1"#)
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(channel.map(ChannelId::new))
    }

    async fn update_status(&self, id: &ChannelId, status: ChannelStatus) -> DirectoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE "Channel"
            SET status = $2, "updatedAt" = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::ChannelNotFound(id.clone()));
        }
        Ok(())
    }
}

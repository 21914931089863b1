//! Conversations: a tagging relation that groups related runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::sql::Record;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Conversation {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub agent_key: String,
    #[builder(default)]
    pub title: String,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
impl Record for Conversation {
    const TABLE: &'static str = "agent_conversations";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let conversation = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, agent_key, title, metadata, created_at, updated_at
            FROM agent_conversations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(conversation)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let conversation = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO agent_conversations (id, agent_key, title, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, agent_key, title, metadata, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.agent_key)
        .bind(&self.title)
        .bind(&self.metadata)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_empty_title() {
        let conversation = Conversation::builder().agent_key("echo").build();
        assert_eq!(conversation.title, "");
        assert_eq!(conversation.metadata, serde_json::json!({}));
    }
}

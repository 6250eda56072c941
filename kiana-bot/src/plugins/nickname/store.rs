use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use shared::Database;
use tracing::{info, warn};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nicknames (
        group_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        nickname TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (group_id, nickname)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nicknames_member ON nicknames(group_id, user_id)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The member already has this nickname
    AlreadyOwned,
    /// Another member in the group holds it
    Occupied,
}

/// Per-group nickname bindings. A nickname belongs to at most one member of
/// a group; a member may have many.
#[derive(Clone)]
pub struct NicknameStore {
    db: Database,
}

impl NicknameStore {
    pub async fn new(db: Database) -> Result<Self> {
        db.ensure_schema(SCHEMA).await?;
        Ok(Self { db })
    }

    pub async fn add(&self, group_id: &str, user_id: &str, nickname: &str) -> Result<AddOutcome> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO nicknames (group_id, user_id, nickname, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(nickname)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(AddOutcome::Added);
        }

        let owner: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM nicknames WHERE group_id = ? AND nickname = ?")
                .bind(group_id)
                .bind(nickname)
                .fetch_optional(self.db.pool())
                .await?;

        Ok(match owner {
            Some((owner,)) if owner == user_id => AddOutcome::AlreadyOwned,
            _ => AddOutcome::Occupied,
        })
    }

    /// Nicknames of a member, oldest first.
    pub async fn nicknames_of(&self, group_id: &str, user_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT nickname FROM nicknames WHERE group_id = ? AND user_id = ? ORDER BY rowid",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|(nickname,)| nickname).collect())
    }

    /// nickname → user id for one group.
    pub async fn bindings(&self, group_id: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT nickname, user_id FROM nicknames WHERE group_id = ?")
                .bind(group_id)
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Returns `(removed, not_found)`, each in request order.
    pub async fn remove(
        &self,
        group_id: &str,
        user_id: &str,
        nicknames: &[String],
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut removed = Vec::new();
        let mut not_found = Vec::new();

        for nickname in nicknames {
            let affected =
                sqlx::query("DELETE FROM nicknames WHERE group_id = ? AND user_id = ? AND nickname = ?")
                    .bind(group_id)
                    .bind(user_id)
                    .bind(nickname)
                    .execute(self.db.pool())
                    .await?
                    .rows_affected();
            if affected > 0 {
                removed.push(nickname.clone());
            } else {
                not_found.push(nickname.clone());
            }
        }

        Ok((removed, not_found))
    }

    /// Drops every nickname of a member and returns what was cleared.
    pub async fn clear(&self, group_id: &str, user_id: &str) -> Result<Vec<String>> {
        let cleared = self.nicknames_of(group_id, user_id).await?;
        sqlx::query("DELETE FROM nicknames WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id)
            .execute(self.db.pool())
            .await?;
        Ok(cleared)
    }

    /// Imports a `nicknames.json` written by earlier versions, then renames it
    /// so it is only imported once. Understands both `{group: {nickname:
    /// user}}` and `{group: {user: [nickname, ...]}}`.
    pub async fn import_legacy(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }

        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {path:?}"))?;
        let data: HashMap<String, HashMap<String, Value>> =
            serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {path:?}"))?;

        let mut imported = 0;
        for (group_id, entries) in &data {
            for (key, value) in entries {
                let pairs: Vec<(&str, &str)> = match value {
                    Value::String(user_id) => vec![(user_id.as_str(), key.as_str())],
                    Value::Array(nicknames) => nicknames
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|nickname| (key.as_str(), nickname))
                        .collect(),
                    other => {
                        warn!("Skipping unexpected nickname entry {key}: {other}");
                        continue;
                    }
                };

                for (user_id, nickname) in pairs {
                    if self.add(group_id, user_id, nickname).await? == AddOutcome::Added {
                        imported += 1;
                    }
                }
            }
        }

        let mut done = path.as_os_str().to_owned();
        done.push(".imported");
        tokio::fs::rename(path, &done)
            .await
            .with_context(|| format!("Failed to rename {path:?}"))?;

        info!("Imported {imported} legacy nicknames from {path:?}");
        Ok(imported)
    }
}

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{to_rfc3339, StorageError};

/// Contact directory used as the recipient fallback for queued notifications.
#[derive(Clone)]
pub struct UserRepository {
    pub(crate) pool: SqlitePool,
}

impl UserRepository {
    /// Records the caller's contact details. Blank or missing fields keep the stored value.
    pub async fn upsert(
        &self,
        user_id: i64,
        name: Option<&str>,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let name = name.map(str::trim).filter(|value| !value.is_empty());
        let email = email.map(str::trim).filter(|value| !value.is_empty());
        sqlx::query(
            "INSERT INTO users (id, name, email, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 name = COALESCE(excluded.name, users.name), \
                 email = COALESCE(excluded.email, users.email), \
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(name)
        .bind(email)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn email_for(&self, user_id: i64) -> Result<Option<String>, StorageError> {
        let email: Option<(Option<String>,)> =
            sqlx::query_as("SELECT email FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(email.and_then(|(email,)| email))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{at, setup_db};

    #[tokio::test]
    async fn upsert_keeps_known_values() {
        let db = setup_db().await;
        let users = db.users();
        users
            .upsert(4, Some("Ana"), Some("ana@example.com"), at(2025, 1, 1))
            .await
            .unwrap();
        users.upsert(4, Some("Ana M."), Some("  "), at(2025, 1, 2)).await.unwrap();

        assert_eq!(
            users.email_for(4).await.unwrap().as_deref(),
            Some("ana@example.com")
        );
        assert_eq!(users.email_for(5).await.unwrap(), None);
    }
}

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use loyalty_core::{
    notify::NewNotification,
    types::{NotificationItem, NotificationStatus},
};

use crate::{to_rfc3339, StorageError};

const MAX_ERROR_LEN: usize = 500;

/// Repository for the notification dispatch queue.
#[derive(Clone)]
pub struct NotificationRepository {
    pub(crate) pool: SqlitePool,
}

impl NotificationRepository {
    /// Inserts a `Queued` row unless one with the same dedupe key already exists.
    pub async fn enqueue(
        &self,
        notification: &NewNotification,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StorageError> {
        let dedupe_key = notification.resolved_dedupe_key();
        let payload = serde_json::to_string(&notification.payload)
            .map_err(|err| StorageError::Decode(err.to_string()))?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO notifications_queue \
             (kind, user_id, email, payload, status, dedupe_key, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(dedupe_key) DO NOTHING \
             RETURNING id",
        )
        .bind(notification.kind.as_str())
        .bind(notification.user_id)
        .bind(&notification.email)
        .bind(payload)
        .bind(NotificationStatus::Queued.as_str())
        .bind(&dedupe_key)
        .bind(to_rfc3339(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some((id,)) => EnqueueOutcome::Queued { id, dedupe_key },
            None => EnqueueOutcome::Duplicate { dedupe_key },
        })
    }

    /// Oldest `Queued` rows with their template and resolved recipient.
    ///
    /// The row's own email wins; otherwise the contact directory entry for `user_id` is used.
    pub async fn fetch_queued(&self, limit: i64) -> Result<Vec<QueuedNotification>, StorageError> {
        let rows = sqlx::query_as::<_, QueuedRow>(
            r#"
SELECT q.id, q.kind, q.user_id, q.payload,
       COALESCE(NULLIF(TRIM(q.email), ''), NULLIF(TRIM(u.email), '')) AS recipient,
       t.subject AS template_subject,
       t.html AS template_html
  FROM notifications_queue AS q
  LEFT JOIN email_templates AS t ON t.code = q.kind
  LEFT JOIN users AS u ON u.id = q.user_id
 WHERE q.status = ?
 ORDER BY q.id ASC
 LIMIT ?
            "#,
        )
        .bind(NotificationStatus::Queued.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(QueuedRow::into_queued).collect())
    }

    pub async fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE notifications_queue SET status = ?, sent_at = ?, error = NULL \
             WHERE id = ? AND status = ?",
        )
        .bind(NotificationStatus::Sent.as_str())
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(NotificationStatus::Queued.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks the row `Failed`, keeping at most 500 characters of the error.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<bool, StorageError> {
        let error: String = error.chars().take(MAX_ERROR_LEN).collect();
        let result = sqlx::query(
            "UPDATE notifications_queue SET status = ?, error = ? WHERE id = ? AND status = ?",
        )
        .bind(NotificationStatus::Failed.as_str())
        .bind(error)
        .bind(id)
        .bind(NotificationStatus::Queued.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: i64) -> Result<Option<NotificationItem>, StorageError> {
        let row = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, kind, user_id, email, payload, status, dedupe_key, created_at, sent_at, error \
             FROM notifications_queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(NotificationRow::into_domain).transpose()
    }

    pub async fn find_by_dedupe_key(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<NotificationItem>, StorageError> {
        let row = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, kind, user_id, email, payload, status, dedupe_key, created_at, sent_at, error \
             FROM notifications_queue WHERE dedupe_key = ?",
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(NotificationRow::into_domain).transpose()
    }
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { id: i64, dedupe_key: String },
    Duplicate { dedupe_key: String },
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// A `Queued` row ready for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedNotification {
    pub id: i64,
    pub kind: String,
    pub user_id: Option<i64>,
    pub recipient: Option<String>,
    pub payload: Value,
    /// `(subject, html)` of the stored template for `kind`, when one exists.
    pub template: Option<(String, String)>,
}

#[derive(Debug, sqlx::FromRow)]
struct QueuedRow {
    id: i64,
    kind: String,
    user_id: Option<i64>,
    payload: String,
    recipient: Option<String>,
    template_subject: Option<String>,
    template_html: Option<String>,
}

impl QueuedRow {
    fn into_queued(self) -> QueuedNotification {
        // Unparseable payloads still render through the generic body.
        let payload = serde_json::from_str(&self.payload).unwrap_or(Value::String(self.payload));
        let template = match (self.template_subject, self.template_html) {
            (Some(subject), Some(html)) => Some((subject, html)),
            _ => None,
        };
        QueuedNotification {
            id: self.id,
            kind: self.kind,
            user_id: self.user_id,
            recipient: self.recipient,
            payload,
            template,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    kind: String,
    user_id: Option<i64>,
    email: Option<String>,
    payload: String,
    status: String,
    dedupe_key: String,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl NotificationRow {
    fn into_domain(self) -> Result<NotificationItem, StorageError> {
        let payload = serde_json::from_str(&self.payload)
            .map_err(|err| StorageError::Decode(format!("notification payload: {err}")))?;
        Ok(NotificationItem {
            id: self.id,
            kind: self.kind,
            user_id: self.user_id,
            email: self.email,
            payload,
            status: self.status.parse()?,
            dedupe_key: self.dedupe_key,
            created_at: self.created_at,
            sent_at: self.sent_at,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, setup_db};
    use loyalty_core::notify::NotificationKind;
    use serde_json::json;

    #[tokio::test]
    async fn same_dedupe_key_queues_once() {
        let db = setup_db().await;
        let repo = db.notifications();
        let notification = NewNotification::new(
            NotificationKind::WithdrawalApproved,
            Some(3),
            json!({ "withdrawalId": 11, "points": 50 }),
        );

        let first = repo.enqueue(&notification, at(2025, 4, 3)).await.unwrap();
        let second = repo.enqueue(&notification, at(2025, 4, 3)).await.unwrap();
        assert!(first.is_queued());
        assert_eq!(
            second,
            EnqueueOutcome::Duplicate {
                dedupe_key: "withdrawal_approved:3:11".into()
            }
        );

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications_queue")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn fetch_queued_joins_template_and_directory_email() {
        let db = setup_db().await;
        db.users()
            .upsert(3, Some("Ana"), Some("ana@example.com"), at(2025, 1, 1))
            .await
            .unwrap();
        let repo = db.notifications();
        repo.enqueue(
            &NewNotification::new(NotificationKind::Penalty, Some(3), json!({ "refId": 1 })),
            at(2025, 1, 2),
        )
        .await
        .unwrap();
        let custom =
            NewNotification::new(NotificationKind::StatusChange, None, json!({ "refId": 2 }))
                .with_email(Some("ops@example.com".into()));
        repo.enqueue(&custom, at(2025, 1, 2)).await.unwrap();

        let queued = repo.fetch_queued(10).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].recipient.as_deref(), Some("ana@example.com"));
        assert!(queued[0].template.is_some());
        assert_eq!(queued[1].recipient.as_deref(), Some("ops@example.com"));
        assert_eq!(repo.fetch_queued(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn marking_moves_rows_out_of_the_queue_once() {
        let db = setup_db().await;
        let repo = db.notifications();
        let EnqueueOutcome::Queued { id: sent, .. } = repo
            .enqueue(
                &NewNotification::new(NotificationKind::Penalty, Some(1), json!({ "refId": 1 })),
                at(2025, 1, 2),
            )
            .await
            .unwrap()
        else {
            panic!("expected queued row");
        };
        let EnqueueOutcome::Queued { id: failed, .. } = repo
            .enqueue(
                &NewNotification::new(NotificationKind::Penalty, Some(1), json!({ "refId": 2 })),
                at(2025, 1, 2),
            )
            .await
            .unwrap()
        else {
            panic!("expected queued row");
        };

        assert!(repo.mark_sent(sent, at(2025, 1, 3)).await.unwrap());
        assert!(!repo.mark_sent(sent, at(2025, 1, 4)).await.unwrap());
        let long_error = "x".repeat(800);
        assert!(repo.mark_failed(failed, &long_error).await.unwrap());

        let sent = repo.get(sent).await.unwrap().unwrap();
        assert_eq!(sent.status, NotificationStatus::Sent);
        assert_eq!(sent.sent_at, Some(at(2025, 1, 3)));
        let failed = repo.get(failed).await.unwrap().unwrap();
        assert_eq!(failed.status, NotificationStatus::Failed);
        assert_eq!(failed.error.map(|error| error.len()), Some(500));
        assert!(repo.fetch_queued(10).await.unwrap().is_empty());
    }
}

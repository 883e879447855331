use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use loyalty_core::program::{
    ProgramConfig, ProgramPatch, SettingKey, SettingValue, DEFAULT_PROGRAM_NAME,
};

use crate::{to_rfc3339, StorageError};

/// Repository for program rows and their tagged settings.
#[derive(Clone)]
pub struct ProgramRepository {
    pub(crate) pool: SqlitePool,
}

impl ProgramRepository {
    /// Loads the program identified by `code`, creating it with default settings on first access.
    pub async fn get_or_create(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<ProgramConfig, StorageError> {
        let created_at = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO loyalty_programs (code, name, active, created_at, updated_at) \
             VALUES (?, ?, 1, ?, ?) \
             ON CONFLICT(code) DO NOTHING",
        )
        .bind(code)
        .bind(DEFAULT_PROGRAM_NAME)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        self.load(code).await
    }

    async fn load(&self, code: &str) -> Result<ProgramConfig, StorageError> {
        let row = sqlx::query("SELECT id, code, name, active FROM loyalty_programs WHERE code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        let id: i64 = row.get("id");
        let name: String = row.get("name");
        let active: bool = row.get("active");

        let rows = sqlx::query(
            "SELECT key, value_kind, value FROM loyalty_program_settings WHERE program_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        // Unknown keys and malformed values are left out so the defaults apply.
        let settings = rows.iter().filter_map(|setting| {
            let key = SettingKey::from_str(setting.get::<&str, _>("key")).ok()?;
            let value = SettingValue::decode(
                setting.get::<&str, _>("value_kind"),
                setting.get::<&str, _>("value"),
            )
            .ok()?;
            Some((key, value))
        });

        Ok(ProgramConfig::from_settings(
            id,
            row.get::<String, _>("code"),
            name,
            active,
            settings.collect::<Vec<_>>(),
        ))
    }

    /// Merges the provided fields into the program, writing every key in one transaction.
    pub async fn apply_patch(
        &self,
        code: &str,
        patch: &ProgramPatch,
        now: DateTime<Utc>,
    ) -> Result<ProgramConfig, StorageError> {
        let program = self.get_or_create(code, now).await?;
        let updated_at = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        if patch.name.is_some() || patch.active.is_some() {
            sqlx::query(
                "UPDATE loyalty_programs \
                 SET name = COALESCE(?, name), active = COALESCE(?, active), updated_at = ? \
                 WHERE id = ?",
            )
            .bind(patch.name.as_deref().map(str::trim))
            .bind(patch.active)
            .bind(&updated_at)
            .bind(program.id)
            .execute(&mut *tx)
            .await?;
        }

        for (key, value) in patch.settings() {
            upsert_setting(&mut tx, program.id, key, &value, &updated_at, true).await?;
        }

        tx.commit().await?;
        self.load(code).await
    }

    /// Moves rows of the old multi-column layout into tagged settings.
    ///
    /// Values already present in tagged form win. Returns the number of converted rows.
    pub async fn import_legacy_settings(
        &self,
        program_id: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let updated_at = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT id, key, value_json, value_int, value_text \
             FROM legacy_program_settings WHERE program_id = ? ORDER BY id",
        )
        .bind(program_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut imported = 0;
        for row in rows {
            let Ok(key) = SettingKey::from_str(row.get::<&str, _>("key")) else {
                continue;
            };
            let Some(value) = SettingValue::from_legacy(
                row.get::<Option<&str>, _>("value_json"),
                row.get::<Option<i64>, _>("value_int"),
                row.get::<Option<&str>, _>("value_text"),
            ) else {
                continue;
            };

            upsert_setting(&mut tx, program_id, key, &value, &updated_at, false).await?;
            sqlx::query("DELETE FROM legacy_program_settings WHERE id = ?")
                .bind(row.get::<i64, _>("id"))
                .execute(&mut *tx)
                .await?;
            imported += 1;
        }

        tx.commit().await?;
        Ok(imported)
    }
}

async fn upsert_setting(
    tx: &mut Transaction<'_, Sqlite>,
    program_id: i64,
    key: SettingKey,
    value: &SettingValue,
    updated_at: &str,
    overwrite: bool,
) -> Result<(), StorageError> {
    let sql = if overwrite {
        "INSERT INTO loyalty_program_settings (program_id, key, value_kind, value, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(program_id, key) DO UPDATE \
         SET value_kind = excluded.value_kind, value = excluded.value, updated_at = excluded.updated_at"
    } else {
        "INSERT INTO loyalty_program_settings (program_id, key, value_kind, value, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(program_id, key) DO NOTHING"
    };
    sqlx::query(sql)
        .bind(program_id)
        .bind(key.as_str())
        .bind(value.kind())
        .bind(value.encode())
        .bind(updated_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, setup_db};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let db = setup_db().await;
        let repo = db.programs();
        let first = repo.get_or_create("STAFF", at(2025, 1, 1)).await.unwrap();
        let second = repo.get_or_create("STAFF", at(2025, 2, 1)).await.unwrap();
        assert_eq!(first, second);
        assert!(first.active);
        assert_eq!(first.signup_bonus, 100);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM loyalty_programs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn patch_merges_only_provided_fields() {
        let db = setup_db().await;
        let repo = db.programs();
        repo.get_or_create("STAFF", at(2025, 1, 1)).await.unwrap();

        let patch = ProgramPatch {
            signup_bonus: Some(50),
            eur_per_point: Some(dec!(0.25)),
            ..ProgramPatch::default()
        };
        let updated = repo.apply_patch("STAFF", &patch, at(2025, 1, 2)).await.unwrap();
        assert_eq!(updated.signup_bonus, 50);
        assert_eq!(updated.eur_per_point, dec!(0.25));
        assert_eq!(updated.duration_months, 6);

        let patch = ProgramPatch {
            active: Some(false),
            eligible_roles: Some(vec!["Staff".into(), "Driver".into()]),
            ..ProgramPatch::default()
        };
        let updated = repo.apply_patch("STAFF", &patch, at(2025, 1, 3)).await.unwrap();
        assert!(!updated.active);
        assert_eq!(updated.signup_bonus, 50);
        assert!(updated.is_role_eligible("driver"));
    }

    #[tokio::test]
    async fn stored_rows_of_any_kind_are_coerced() {
        let db = setup_db().await;
        let program = db.programs().get_or_create("STAFF", at(2025, 1, 1)).await.unwrap();
        for (key, kind, value) in [
            ("durationMonths", "text", "12"),
            ("minWithdrawPoints", "real", "250.0"),
            ("signupBonus", "json", "\"25\""),
            ("withdrawWaitDays", "int", "-4"),
        ] {
            sqlx::query(
                "INSERT INTO loyalty_program_settings (program_id, key, value_kind, value, updated_at) \
                 VALUES (?, ?, ?, ?, '2025-01-01T00:00:00.000Z')",
            )
            .bind(program.id)
            .bind(key)
            .bind(kind)
            .bind(value)
            .execute(db.pool())
            .await
            .unwrap();
        }

        let config = db.programs().get_or_create("STAFF", at(2025, 1, 2)).await.unwrap();
        assert_eq!(config.duration_months, 12);
        assert_eq!(config.min_withdraw_points, 250);
        assert_eq!(config.signup_bonus, 25);
        assert_eq!(config.withdraw_wait_days, 90);
    }

    #[tokio::test]
    async fn legacy_rows_are_imported_once() {
        let db = setup_db().await;
        let program = db.programs().get_or_create("STAFF", at(2025, 1, 1)).await.unwrap();
        sqlx::query(
            "INSERT INTO legacy_program_settings (program_id, key, value_json, value_int, value_text) VALUES \
             (?, 'eligibleUserTypes', '[\"Staff\",\"Installer\"]', NULL, NULL), \
             (?, 'durationMonths', NULL, 9, NULL), \
             (?, 'eurPerPoint', NULL, NULL, '0.5'), \
             (?, 'unknownKey', NULL, 1, NULL)",
        )
        .bind(program.id)
        .bind(program.id)
        .bind(program.id)
        .bind(program.id)
        .execute(db.pool())
        .await
        .unwrap();

        let imported = db
            .programs()
            .import_legacy_settings(program.id, at(2025, 1, 2))
            .await
            .unwrap();
        assert_eq!(imported, 3);
        let again = db
            .programs()
            .import_legacy_settings(program.id, at(2025, 1, 3))
            .await
            .unwrap();
        assert_eq!(again, 0);

        let config = db.programs().get_or_create("STAFF", at(2025, 1, 3)).await.unwrap();
        assert!(config.is_role_eligible("installer"));
        assert_eq!(config.duration_months, 9);
        assert_eq!(config.eur_per_point, dec!(0.5));

        let kinds: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value_kind FROM loyalty_program_settings ORDER BY key",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(
            kinds,
            vec![
                ("durationMonths".to_string(), "int".to_string()),
                ("eligibleRoles".to_string(), "json".to_string()),
                ("eurPerPoint".to_string(), "text".to_string()),
            ]
        );
    }
}

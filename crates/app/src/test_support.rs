use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use loyalty_core::types::Caller;
use loyalty_storage::Database;

use crate::context::LoyaltyContext;

pub async fn setup_db() -> Database {
    let db = Database::connect("sqlite::memory:?cache=shared")
        .await
        .expect("connect");
    db.run_migrations().await.expect("migrations");
    db
}

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
}

/// Context whose clock is frozen at 09:00 UTC on the given day.
pub fn context_at(db: &Database, y: i32, m: u32, d: u32) -> LoyaltyContext {
    let now = at(y, m, d);
    LoyaltyContext::new(db.clone(), "STAFF", chrono_tz::UTC).with_clock(Arc::new(move || now))
}

/// Settable clock shared by every context built from it.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn at(y: i32, m: u32, d: u32) -> Self {
        Self {
            now: Arc::new(Mutex::new(at(y, m, d))),
        }
    }

    pub fn set(&self, y: i32, m: u32, d: u32) {
        *self.now.lock().unwrap() = at(y, m, d);
    }

    pub fn set_day(&self, day: NaiveDate) {
        let now = day.and_hms_opt(9, 0, 0).unwrap().and_utc();
        *self.now.lock().unwrap() = now;
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn context(&self, db: &Database) -> LoyaltyContext {
        let now = Arc::clone(&self.now);
        LoyaltyContext::new(db.clone(), "STAFF", chrono_tz::UTC)
            .with_clock(Arc::new(move || *now.lock().unwrap()))
    }
}

pub fn member(user_id: i64) -> Caller {
    Caller {
        user_id,
        role: "Staff".into(),
        email: Some(format!("member{user_id}@example.com")),
        name: Some(format!("Member {user_id}")),
    }
}

pub fn admin() -> Caller {
    Caller {
        user_id: 1,
        role: "Admin".into(),
        email: Some("admin@example.com".into()),
        name: Some("Admin".into()),
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Grade placeholder for a control event that has no grade yet.
pub const ABSENT_GRADE: &str = "отсутствует";

/// Control events with this prefix fluctuate too often to be worth a notification.
pub const VOLATILE_EVENT_PREFIX: &str = "Балл текущего контроля";

pub type UserId = i64;

/// Stored portal credentials; `password` is still encrypted here.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: UserId,
    pub username: String,
    pub password: Vec<u8>,
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub name: String,
    pub grade: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discipline {
    pub name: String,
    pub control_events: Vec<ControlEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressTable {
    #[serde(skip)]
    pub user_id: UserId,
    pub disciplines: Vec<Discipline>,
}

impl ProgressTable {
    /// An empty table means "not fetched yet", never a real state.
    pub fn is_unknown(&self) -> bool {
        self.disciplines.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeChange {
    #[serde(skip)]
    pub user_id: UserId,
    pub discipline: String,
    pub control_event: String,
    pub old_grade: String,
    pub new_grade: String,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub change: GradeChange,
    pub created_at: DateTime<Utc>,
}

/// Why a user's stored credentials are being revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationCause {
    CredentialsExpired,
    WrongGradesPage,
    /// The notification channel can never reach the user again.
    Unreachable,
}

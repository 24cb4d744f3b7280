//! In-memory stand-ins for the database, the portal and the chat channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::crypto::PasswordCipher;
use crate::error::{DeliveryError, PortalError, StoreError};
use crate::models::{
    ControlEvent, Credentials, Discipline, GradeChange, OutboxEntry, ProgressTable,
    RevocationCause, UserId,
};
use crate::portal::Portal;
use crate::store::{CredentialSource, Notifier, OutboxStore, Persistence};

pub fn cipher() -> PasswordCipher {
    PasswordCipher::from_hex(&"42".repeat(32)).unwrap()
}

pub fn table(user_id: UserId, disciplines: &[(&str, &[(&str, &str)])]) -> ProgressTable {
    ProgressTable {
        user_id,
        disciplines: disciplines
            .iter()
            .map(|(name, events)| Discipline {
                name: name.to_string(),
                control_events: events
                    .iter()
                    .map(|(event, grade)| ControlEvent {
                        name: event.to_string(),
                        grade: grade.to_string(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

struct OutboxRow {
    entry: OutboxEntry,
    leased_until: Option<Instant>,
}

#[derive(Default)]
struct MemoryState {
    credentials: HashMap<UserId, Credentials>,
    snapshots: HashMap<UserId, ProgressTable>,
    outbox: Vec<OutboxRow>,
    snapshot_writes: usize,
    revocations: Vec<(UserId, RevocationCause)>,
    fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn add_user(&self, user_id: UserId, username: &str, password: &str) {
        let sealed = cipher().encrypt(password).unwrap();
        self.state.lock().unwrap().credentials.insert(
            user_id,
            Credentials {
                user_id,
                username: username.to_string(),
                password: sealed,
                authenticated: true,
            },
        );
    }

    pub fn credentials(&self, user_id: UserId) -> Credentials {
        self.state.lock().unwrap().credentials[&user_id].clone()
    }

    pub fn put_snapshot(&self, table: ProgressTable) {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .insert(table.user_id, table);
    }

    pub fn snapshot(&self, user_id: UserId) -> Option<ProgressTable> {
        self.state.lock().unwrap().snapshots.get(&user_id).cloned()
    }

    pub fn snapshot_writes(&self) -> usize {
        self.state.lock().unwrap().snapshot_writes
    }

    pub fn is_tracked(&self, user_id: UserId) -> bool {
        self.state
            .lock()
            .unwrap()
            .credentials
            .get(&user_id)
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    pub fn revocations(&self) -> Vec<(UserId, RevocationCause)> {
        self.state.lock().unwrap().revocations.clone()
    }

    pub fn outbox(&self) -> Vec<GradeChange> {
        self.state
            .lock()
            .unwrap()
            .outbox
            .iter()
            .map(|row| row.entry.change.clone())
            .collect()
    }

    pub fn enqueue(&self, change: GradeChange) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().outbox.push(OutboxRow {
            entry: OutboxEntry {
                id,
                user_id: change.user_id,
                change,
                created_at: Utc::now(),
            },
            leased_until: None,
        });
        id
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }
}

#[async_trait]
impl CredentialSource for MemoryStore {
    async fn list_tracked_users(&self) -> Result<Vec<Credentials>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut users: Vec<Credentials> = state
            .credentials
            .values()
            .filter(|c| c.authenticated)
            .cloned()
            .collect();
        users.sort_by_key(|c| c.user_id);
        Ok(users)
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get_snapshot(&self, user_id: UserId) -> Result<Option<ProgressTable>, StoreError> {
        Ok(self.snapshot(user_id))
    }

    async fn save_snapshot(
        &self,
        table: &ProgressTable,
        changes: &[GradeChange],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        state.snapshots.insert(table.user_id, table.clone());
        state.snapshot_writes += 1;
        for change in changes {
            state.outbox.push(OutboxRow {
                entry: OutboxEntry {
                    id: Uuid::new_v4(),
                    user_id: change.user_id,
                    change: change.clone(),
                    created_at: Utc::now(),
                },
                leased_until: None,
            });
        }
        Ok(())
    }

    async fn revoke_user(&self, user_id: UserId, cause: RevocationCause) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(credentials) = state.credentials.get_mut(&user_id) {
            credentials.authenticated = false;
            credentials.password.clear();
        }
        state.snapshots.remove(&user_id);
        state.revocations.push((user_id, cause));
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn pull_batch(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>, StoreError> {
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut claimed = Vec::new();
        for row in state.outbox.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if row.leased_until.map(|until| until > now).unwrap_or(false) {
                continue;
            }
            let revoked = state
                .credentials
                .get(&row.entry.user_id)
                .map(|c| !c.authenticated)
                .unwrap_or(false);
            if revoked {
                continue;
            }
            row.leased_until = Some(now + lease);
            claimed.push(row.entry.clone());
        }
        Ok(claimed)
    }

    async fn release(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for row in state.outbox.iter_mut() {
            if ids.contains(&row.entry.id) {
                row.leased_until = None;
            }
        }
        Ok(())
    }

    async fn delete_delivered(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.outbox.retain(|row| !ids.contains(&row.entry.id));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Deliver,
    Transient,
    Unreachable,
}

/// Records every delivery attempt; failure mode is configurable per user.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(UserId, String)>>>,
    attempts: Arc<AtomicUsize>,
    modes: Arc<Mutex<HashMap<UserId, SendMode>>>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_mode(&self, user_id: UserId, mode: SendMode) {
        self.modes.lock().unwrap().insert(user_id, mode);
    }

    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, user_id: UserId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, text)| text)
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, user_id: UserId, text: &str) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mode = self
            .modes
            .lock()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or(SendMode::Deliver);
        match mode {
            SendMode::Deliver => {
                self.sent.lock().unwrap().push((user_id, text.to_string()));
                Ok(())
            }
            SendMode::Transient => Err(DeliveryError::Transient("flaky".to_string())),
            SendMode::Unreachable => {
                Err(DeliveryError::PermanentlyUnreachable("blocked".to_string()))
            }
        }
    }
}

/// What the fake portal does for one username.
#[derive(Debug, Clone)]
pub enum PortalScript {
    Page(String),
    AuthFails,
    WrongPage,
    Hang,
}

/// Scripted portal shared by every fake session.
#[derive(Clone, Default)]
pub struct FakePortalBackend {
    scripts: Arc<Mutex<HashMap<String, PortalScript>>>,
    logins: Arc<Mutex<Vec<String>>>,
    resets: Arc<AtomicUsize>,
    sessions: Arc<AtomicUsize>,
}

impl FakePortalBackend {
    pub fn script(&self, username: &str, script: PortalScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(username.to_string(), script);
    }

    pub fn session(&self) -> FakePortal {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        FakePortal {
            backend: self.clone(),
            logged_in: None,
        }
    }

    pub fn logins(&self) -> Vec<String> {
        self.logins.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    fn lookup(&self, username: &str) -> PortalScript {
        self.scripts
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .unwrap_or(PortalScript::AuthFails)
    }
}

pub struct FakePortal {
    backend: FakePortalBackend,
    logged_in: Option<String>,
}

#[async_trait]
impl Portal for FakePortal {
    async fn authorize(&mut self, username: &str, _password: &str) -> Result<(), PortalError> {
        assert!(
            self.logged_in.is_none(),
            "session from a previous user was not reset"
        );
        self.backend.logins.lock().unwrap().push(username.to_string());
        match self.backend.lookup(username) {
            PortalScript::AuthFails => Err(PortalError::AuthenticationFailed),
            PortalScript::Hang => std::future::pending().await,
            _ => {
                self.logged_in = Some(username.to_string());
                Ok(())
            }
        }
    }

    async fn fetch_grades_page(&mut self) -> Result<String, PortalError> {
        let username = self.logged_in.clone().ok_or(PortalError::AuthenticationFailed)?;
        match self.backend.lookup(&username) {
            PortalScript::Page(html) => Ok(html),
            _ => Err(PortalError::WrongPage),
        }
    }

    fn reset(&mut self) {
        self.logged_in = None;
        self.backend.resets.fetch_add(1, Ordering::SeqCst);
    }
}

//! SQLite store.
//!
//! Every write runs in an `IMMEDIATE` transaction, which takes the database
//! write lock up front, so the status check and the dependent write are
//! atomic across processes sharing the file. Uniqueness of admissions and
//! letters is enforced by `UNIQUE` constraints.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::{apply_gift_delta, check_transition, schema, CapsuleStore};
use crate::error::StorageError;
use crate::gifts::{GiftAdjustment, PriceList};
use crate::outbox::{DeliverySnapshot, OutboxEntry, OutboxState};
use crate::types::{
    Admission, Admitted, Capsule, CapsuleId, CapsuleStatus, Contributor, ContributorId,
    GiftSelection, InviteCode, Letter, LetterId, SkuId,
};
use crate::{CapsuleError, Result};

const CAPSULE_COLUMNS: &str = "id, title, status, recipients, target_letter_count, target_date, \
     deliver_on_goal_reached, created_by, created_at, version, closed_at";
const INVITE_COLUMNS: &str = "code, capsule_id, issued_at, expires_at, max_uses, uses";
const CONTRIBUTOR_COLUMNS: &str =
    "id, capsule_id, admission_key, display_name, relation_label, joined_at, active";
const LETTER_COLUMNS: &str =
    "id, capsule_id, contributor_id, body, created_at, submitted_at, revision";
const OUTBOX_COLUMNS: &str =
    "id, snapshot, created_at, attempts, state, lease_until, dispatched_at, last_error";

/// SQLite-backed capsule store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the capsule database in `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| StorageError::Internal(format!("creating {}: {}", data_dir.display(), e)))?;
        let db_path = data_dir.join("capsules.db");
        info!(path = %db_path.display(), "Opening capsule database");

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory capsule database");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside an immediate transaction; rolled back if `f` fails.
    fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only query.
    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> std::result::Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp_micros(value)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {} out of range", value)))
}

fn to_u32(value: i64, column: &str) -> std::result::Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::Corrupt(format!("{} out of range: {}", column, value)))
}

struct CapsuleRow {
    id: String,
    title: String,
    status: String,
    recipients: String,
    target_letter_count: i64,
    target_date: String,
    deliver_on_goal_reached: bool,
    created_by: String,
    created_at: i64,
    version: i64,
    closed_at: Option<i64>,
}

impl CapsuleRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            status: row.get(2)?,
            recipients: row.get(3)?,
            target_letter_count: row.get(4)?,
            target_date: row.get(5)?,
            deliver_on_goal_reached: row.get(6)?,
            created_by: row.get(7)?,
            created_at: row.get(8)?,
            version: row.get(9)?,
            closed_at: row.get(10)?,
        })
    }

    fn into_capsule(self) -> Result<Capsule> {
        let status = CapsuleStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown status {}", self.status)))?;
        let target_date = NaiveDate::parse_from_str(&self.target_date, "%Y-%m-%d")
            .map_err(|e| StorageError::Corrupt(format!("target_date {}: {}", self.target_date, e)))?;
        Ok(Capsule {
            id: CapsuleId::new(self.id),
            title: self.title,
            status,
            recipients: serde_json::from_str(&self.recipients)?,
            target_letter_count: to_u32(self.target_letter_count, "target_letter_count")?,
            target_date,
            deliver_on_goal_reached: self.deliver_on_goal_reached,
            created_by: self.created_by,
            created_at: from_micros(self.created_at)?,
            version: u64::try_from(self.version)
                .map_err(|_| StorageError::Corrupt(format!("version {}", self.version)))?,
            closed_at: self.closed_at.map(from_micros).transpose()?,
        })
    }
}

struct InviteRow {
    code: String,
    capsule_id: String,
    issued_at: i64,
    expires_at: Option<i64>,
    max_uses: Option<i64>,
    uses: i64,
}

impl InviteRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            code: row.get(0)?,
            capsule_id: row.get(1)?,
            issued_at: row.get(2)?,
            expires_at: row.get(3)?,
            max_uses: row.get(4)?,
            uses: row.get(5)?,
        })
    }

    fn into_invite(self) -> Result<InviteCode> {
        Ok(InviteCode {
            code: self.code,
            capsule_id: CapsuleId::new(self.capsule_id),
            issued_at: from_micros(self.issued_at)?,
            expires_at: self.expires_at.map(from_micros).transpose()?,
            max_uses: self.max_uses.map(|m| to_u32(m, "max_uses")).transpose()?,
            uses: to_u32(self.uses, "uses")?,
        })
    }
}

struct ContributorRow {
    id: String,
    capsule_id: String,
    admission_key: String,
    display_name: String,
    relation_label: String,
    joined_at: i64,
    active: bool,
}

impl ContributorRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            capsule_id: row.get(1)?,
            admission_key: row.get(2)?,
            display_name: row.get(3)?,
            relation_label: row.get(4)?,
            joined_at: row.get(5)?,
            active: row.get(6)?,
        })
    }

    fn into_contributor(self) -> Result<Contributor> {
        Ok(Contributor {
            id: ContributorId::new(self.id),
            capsule_id: CapsuleId::new(self.capsule_id),
            display_name: self.display_name,
            relation_label: self.relation_label,
            admission_key: self.admission_key,
            joined_at: from_micros(self.joined_at)?,
            active: self.active,
        })
    }
}

struct LetterRow {
    id: String,
    capsule_id: String,
    contributor_id: String,
    body: String,
    created_at: i64,
    submitted_at: i64,
    revision: i64,
}

impl LetterRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            capsule_id: row.get(1)?,
            contributor_id: row.get(2)?,
            body: row.get(3)?,
            created_at: row.get(4)?,
            submitted_at: row.get(5)?,
            revision: row.get(6)?,
        })
    }

    fn into_letter(self) -> Result<Letter> {
        Ok(Letter {
            id: LetterId::new(self.id),
            capsule_id: CapsuleId::new(self.capsule_id),
            contributor_id: ContributorId::new(self.contributor_id),
            body: self.body,
            created_at: from_micros(self.created_at)?,
            submitted_at: from_micros(self.submitted_at)?,
            revision: to_u32(self.revision, "revision")?,
        })
    }
}

struct OutboxRow {
    id: String,
    snapshot: String,
    created_at: i64,
    attempts: i64,
    state: String,
    lease_until: Option<i64>,
    dispatched_at: Option<i64>,
    last_error: Option<String>,
}

impl OutboxRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            snapshot: row.get(1)?,
            created_at: row.get(2)?,
            attempts: row.get(3)?,
            state: row.get(4)?,
            lease_until: row.get(5)?,
            dispatched_at: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<OutboxEntry> {
        let state = match (self.state.as_str(), self.lease_until, self.dispatched_at) {
            ("pending", _, _) => OutboxState::Pending,
            ("claimed", Some(lease), _) => OutboxState::Claimed {
                lease_until: from_micros(lease)?,
            },
            ("dispatched", _, Some(at)) => OutboxState::Dispatched { at: from_micros(at)? },
            (other, _, _) => {
                return Err(StorageError::Corrupt(format!("outbox {} in bad state {}", self.id, other)).into())
            }
        };
        Ok(OutboxEntry {
            id: self.id,
            snapshot: serde_json::from_str(&self.snapshot)?,
            created_at: from_micros(self.created_at)?,
            attempts: to_u32(self.attempts, "attempts")?,
            state,
            last_error: self.last_error,
        })
    }
}

fn load_capsule(conn: &Connection, id: &CapsuleId) -> Result<Option<Capsule>> {
    conn.query_row(
        &format!("SELECT {} FROM capsules WHERE id = ?1", CAPSULE_COLUMNS),
        [id.as_str()],
        CapsuleRow::read,
    )
    .optional()?
    .map(CapsuleRow::into_capsule)
    .transpose()
}

/// The capsule, failing unless it is still collecting.
fn require_open(conn: &Connection, id: &CapsuleId) -> Result<Capsule> {
    let capsule = load_capsule(conn, id)?.ok_or_else(|| CapsuleError::CapsuleNotFound(id.clone()))?;
    if !capsule.status.is_open() {
        return Err(CapsuleError::closed(id, capsule.status));
    }
    Ok(capsule)
}

fn load_contributor(conn: &Connection, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Option<Contributor>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM contributors WHERE id = ?1 AND capsule_id = ?2",
            CONTRIBUTOR_COLUMNS
        ),
        params![contributor_id.as_str(), capsule_id.as_str()],
        ContributorRow::read,
    )
    .optional()?
    .map(ContributorRow::into_contributor)
    .transpose()
}

fn load_letters(conn: &Connection, capsule_id: &CapsuleId) -> Result<Vec<Letter>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM letters WHERE capsule_id = ?1 ORDER BY created_at, id",
        LETTER_COLUMNS
    ))?;
    let rows = stmt
        .query_map([capsule_id.as_str()], LetterRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(LetterRow::into_letter).collect()
}

fn load_gifts(conn: &Connection, capsule_id: &CapsuleId) -> Result<Vec<GiftSelection>> {
    let mut stmt = conn.prepare("SELECT sku_id, quantity FROM gifts WHERE capsule_id = ?1 ORDER BY sku_id")?;
    let rows = stmt
        .query_map([capsule_id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(sku, quantity)| {
            Ok(GiftSelection {
                capsule_id: capsule_id.clone(),
                sku_id: SkuId::new(sku),
                quantity: to_u32(quantity, "quantity")?,
            })
        })
        .collect()
}

fn load_outbox(conn: &Connection, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM outbox {}", OUTBOX_COLUMNS, filter))?;
    let rows = stmt
        .query_map(args, OutboxRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(OutboxRow::into_entry).collect()
}

/// Conditional status write; zero rows changed means the precondition moved.
fn compare_and_set_status(
    conn: &Connection,
    id: &CapsuleId,
    expected_version: u64,
    to: CapsuleStatus,
    at: DateTime<Utc>,
) -> Result<Capsule> {
    let capsule = load_capsule(conn, id)?.ok_or_else(|| CapsuleError::CapsuleNotFound(id.clone()))?;
    check_transition(&capsule, expected_version)?;

    let changed = conn.execute(
        "UPDATE capsules SET status = ?1, version = version + 1, closed_at = ?2
         WHERE id = ?3 AND status = ?4 AND version = ?5",
        params![
            to.as_str(),
            micros(at),
            id.as_str(),
            CapsuleStatus::Collecting.as_str(),
            expected_version as i64
        ],
    )?;
    if changed != 1 {
        return Err(CapsuleError::ConcurrentModification(id.clone()));
    }

    Ok(Capsule {
        status: to,
        version: expected_version + 1,
        closed_at: Some(at),
        ..capsule
    })
}

#[async_trait::async_trait]
impl CapsuleStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_capsule(&self, capsule: &Capsule) -> Result<()> {
        let recipients = serde_json::to_string(&capsule.recipients)?;
        self.with_tx(|conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO capsules ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    CAPSULE_COLUMNS
                ),
                params![
                    capsule.id.as_str(),
                    capsule.title,
                    capsule.status.as_str(),
                    recipients,
                    i64::from(capsule.target_letter_count),
                    capsule.target_date.format("%Y-%m-%d").to_string(),
                    capsule.deliver_on_goal_reached,
                    capsule.created_by,
                    micros(capsule.created_at),
                    capsule.version as i64,
                    capsule.closed_at.map(micros),
                ],
            )?;
            if inserted == 0 {
                return Err(StorageError::Duplicate(format!("capsule {}", capsule.id)).into());
            }
            Ok(())
        })
    }

    async fn capsule(&self, id: &CapsuleId) -> Result<Option<Capsule>> {
        self.with_conn(|conn| load_capsule(conn, id))
    }

    async fn capsules_with_status(&self, status: CapsuleStatus) -> Result<Vec<Capsule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM capsules WHERE status = ?1 ORDER BY created_at, id",
                CAPSULE_COLUMNS
            ))?;
            let rows = stmt
                .query_map([status.as_str()], CapsuleRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(CapsuleRow::into_capsule).collect()
        })
    }

    async fn cancel(&self, id: &CapsuleId, expected_version: u64, at: DateTime<Utc>) -> Result<Capsule> {
        self.with_tx(|conn| compare_and_set_status(conn, id, expected_version, CapsuleStatus::Cancelled, at))
    }

    async fn commit_delivery(
        &self,
        id: &CapsuleId,
        expected_version: u64,
        at: DateTime<Utc>,
        lease: chrono::Duration,
        prices: &PriceList,
    ) -> Result<OutboxEntry> {
        self.with_tx(|conn| {
            let capsule = compare_and_set_status(conn, id, expected_version, CapsuleStatus::Delivered, at)?;

            let gifts = load_gifts(conn, id)?;
            let snapshot = DeliverySnapshot {
                capsule_id: id.clone(),
                title: capsule.title,
                recipients: capsule.recipients,
                letters: load_letters(conn, id)?,
                gift_total: prices.price(&gifts),
                gifts,
                delivered_at: at,
            };
            let entry = OutboxEntry::claimed(snapshot, at, lease);
            let lease_until = match entry.state {
                OutboxState::Claimed { lease_until } => micros(lease_until),
                _ => micros(at),
            };

            conn.execute(
                "INSERT INTO outbox (id, capsule_id, snapshot, created_at, attempts, state, lease_until)
                 VALUES (?1, ?2, ?3, ?4, 0, 'claimed', ?5)",
                params![
                    entry.id,
                    id.as_str(),
                    serde_json::to_string(&entry.snapshot)?,
                    micros(at),
                    lease_until
                ],
            )?;

            debug!(capsule_id = %id, entry_id = %entry.id, "Delivery committed");
            Ok(entry)
        })
    }

    async fn insert_invite(&self, invite: &InviteCode) -> Result<bool> {
        self.with_tx(|conn| {
            let capsule = load_capsule(conn, &invite.capsule_id)?
                .ok_or_else(|| CapsuleError::CapsuleNotFound(invite.capsule_id.clone()))?;
            if !capsule.status.is_open() {
                return Err(CapsuleError::CapsuleNotOpen {
                    id: capsule.id,
                    status: capsule.status,
                });
            }

            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO invites ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    INVITE_COLUMNS
                ),
                params![
                    invite.code,
                    invite.capsule_id.as_str(),
                    micros(invite.issued_at),
                    invite.expires_at.map(micros),
                    invite.max_uses.map(i64::from),
                    i64::from(invite.uses),
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    async fn invite(&self, code: &str) -> Result<Option<InviteCode>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM invites WHERE code = ?1", INVITE_COLUMNS),
                [code],
                InviteRow::read,
            )
            .optional()?
            .map(InviteRow::into_invite)
            .transpose()
        })
    }

    async fn redeem(&self, code: &str, admission: &Admission, now: DateTime<Utc>) -> Result<Admitted> {
        self.with_tx(|conn| {
            let invite = conn
                .query_row(
                    &format!("SELECT {} FROM invites WHERE code = ?1", INVITE_COLUMNS),
                    [code],
                    InviteRow::read,
                )
                .optional()?
                .ok_or(CapsuleError::InviteUnknown)?
                .into_invite()?;
            require_open(conn, &invite.capsule_id)?;

            let existing = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM contributors WHERE capsule_id = ?1 AND admission_key = ?2",
                        CONTRIBUTOR_COLUMNS
                    ),
                    params![invite.capsule_id.as_str(), admission.admission_key],
                    ContributorRow::read,
                )
                .optional()?;
            if let Some(row) = existing {
                let mut contributor = row.into_contributor()?;
                if !contributor.active {
                    conn.execute(
                        "UPDATE contributors SET active = 1 WHERE id = ?1",
                        [contributor.id.as_str()],
                    )?;
                    contributor.active = true;
                }
                return Ok(Admitted {
                    contributor,
                    newly_admitted: false,
                });
            }

            if invite.is_expired(now) {
                return Err(CapsuleError::InviteExpired);
            }
            if invite.is_exhausted() {
                return Err(CapsuleError::InviteExhausted);
            }

            let contributor = Contributor {
                id: ContributorId::generate(),
                capsule_id: invite.capsule_id.clone(),
                display_name: admission.display_name.clone(),
                relation_label: admission.relation_label.clone(),
                admission_key: admission.admission_key.clone(),
                joined_at: now,
                active: true,
            };
            conn.execute(
                &format!(
                    "INSERT INTO contributors ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                    CONTRIBUTOR_COLUMNS
                ),
                params![
                    contributor.id.as_str(),
                    contributor.capsule_id.as_str(),
                    contributor.admission_key,
                    contributor.display_name,
                    contributor.relation_label,
                    micros(now),
                ],
            )?;
            conn.execute("UPDATE invites SET uses = uses + 1 WHERE code = ?1", [code])?;

            Ok(Admitted {
                contributor,
                newly_admitted: true,
            })
        })
    }

    async fn deactivate_contributor(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Contributor> {
        self.with_tx(|conn| {
            require_open(conn, capsule_id)?;
            let mut contributor = load_contributor(conn, capsule_id, contributor_id)?
                .ok_or_else(|| CapsuleError::ContributorNotFound(contributor_id.clone()))?;
            conn.execute(
                "UPDATE contributors SET active = 0 WHERE id = ?1",
                [contributor_id.as_str()],
            )?;
            contributor.active = false;
            Ok(contributor)
        })
    }

    async fn contributor(&self, capsule_id: &CapsuleId, contributor_id: &ContributorId) -> Result<Option<Contributor>> {
        self.with_conn(|conn| load_contributor(conn, capsule_id, contributor_id))
    }

    async fn contributors(&self, capsule_id: &CapsuleId) -> Result<Vec<Contributor>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM contributors WHERE capsule_id = ?1 ORDER BY joined_at, id",
                CONTRIBUTOR_COLUMNS
            ))?;
            let rows = stmt
                .query_map([capsule_id.as_str()], ContributorRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ContributorRow::into_contributor).collect()
        })
    }

    async fn upsert_letter(
        &self,
        capsule_id: &CapsuleId,
        contributor_id: &ContributorId,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Letter> {
        self.with_tx(|conn| {
            require_open(conn, capsule_id)?;
            let contributor = load_contributor(conn, capsule_id, contributor_id)?
                .ok_or_else(|| CapsuleError::ContributorNotFound(contributor_id.clone()))?;
            if !contributor.active {
                return Err(CapsuleError::ContributorInactive(contributor_id.clone()));
            }

            conn.execute(
                "INSERT INTO letters (id, capsule_id, contributor_id, body, created_at, submitted_at, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
                 ON CONFLICT (capsule_id, contributor_id) DO UPDATE SET
                    body = excluded.body,
                    submitted_at = excluded.submitted_at,
                    revision = letters.revision + 1",
                params![
                    LetterId::generate().as_str(),
                    capsule_id.as_str(),
                    contributor_id.as_str(),
                    body,
                    micros(now),
                ],
            )?;

            conn.query_row(
                &format!(
                    "SELECT {} FROM letters WHERE capsule_id = ?1 AND contributor_id = ?2",
                    LETTER_COLUMNS
                ),
                params![capsule_id.as_str(), contributor_id.as_str()],
                LetterRow::read,
            )?
            .into_letter()
        })
    }

    async fn letters(&self, capsule_id: &CapsuleId) -> Result<Vec<Letter>> {
        self.with_conn(|conn| load_letters(conn, capsule_id))
    }

    async fn count_letters(&self, capsule_id: &CapsuleId) -> Result<u32> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT contributor_id) FROM letters
                 WHERE capsule_id = ?1 AND length(trim(body)) > 0",
                [capsule_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(to_u32(count, "letter count")?)
        })
    }

    async fn adjust_gift(&self, capsule_id: &CapsuleId, sku_id: &SkuId, delta: i64) -> Result<GiftAdjustment> {
        self.with_tx(|conn| {
            require_open(conn, capsule_id)?;
            let previous: i64 = conn
                .query_row(
                    "SELECT quantity FROM gifts WHERE capsule_id = ?1 AND sku_id = ?2",
                    params![capsule_id.as_str(), sku_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let previous = to_u32(previous, "quantity")?;
            let (next, clamped) = apply_gift_delta(previous, delta)?;

            conn.execute(
                "INSERT INTO gifts (capsule_id, sku_id, quantity) VALUES (?1, ?2, ?3)
                 ON CONFLICT (capsule_id, sku_id) DO UPDATE SET quantity = excluded.quantity",
                params![capsule_id.as_str(), sku_id.as_str(), i64::from(next)],
            )?;

            Ok(GiftAdjustment {
                selection: GiftSelection {
                    capsule_id: capsule_id.clone(),
                    sku_id: sku_id.clone(),
                    quantity: next,
                },
                previous,
                clamped,
            })
        })
    }

    async fn gifts(&self, capsule_id: &CapsuleId) -> Result<Vec<GiftSelection>> {
        self.with_conn(|conn| load_gifts(conn, capsule_id))
    }

    async fn claim_outbox(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>> {
        self.with_tx(|conn| {
            let ids: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT id FROM outbox
                     WHERE state = 'pending' OR (state = 'claimed' AND lease_until <= ?1)
                     ORDER BY created_at, id LIMIT ?2",
                )?;
                let ids = stmt
                    .query_map(params![micros(now), limit as i64], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                conn.execute(
                    "UPDATE outbox SET state = 'claimed', lease_until = ?1 WHERE id = ?2",
                    params![micros(lease_until), id],
                )?;
                claimed.extend(load_outbox(conn, "WHERE id = ?1", &[&id])?);
            }
            Ok(claimed)
        })
    }

    async fn complete_outbox(&self, entry_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_tx(|conn| {
            let changed = conn.execute(
                "UPDATE outbox SET state = 'dispatched', dispatched_at = ?1, lease_until = NULL, last_error = NULL
                 WHERE id = ?2",
                params![micros(at), entry_id],
            )?;
            if changed == 0 {
                return Err(StorageError::Corrupt(format!("outbox entry {} not found", entry_id)).into());
            }
            Ok(())
        })
    }

    async fn release_outbox(&self, entry_id: &str, error: &str) -> Result<()> {
        self.with_tx(|conn| {
            conn.execute(
                "UPDATE outbox SET state = 'pending', lease_until = NULL, attempts = attempts + 1, last_error = ?1
                 WHERE id = ?2 AND state != 'dispatched'",
                params![error, entry_id],
            )?;
            Ok(())
        })
    }

    async fn outbox_for(&self, capsule_id: &CapsuleId) -> Result<Option<OutboxEntry>> {
        self.with_conn(|conn| {
            Ok(load_outbox(conn, "WHERE capsule_id = ?1", &[&capsule_id.as_str()])?
                .into_iter()
                .next())
        })
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        self.with_conn(|conn| load_outbox(conn, "WHERE state != 'dispatched' ORDER BY created_at, id", &[]))
    }
}

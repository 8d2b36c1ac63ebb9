//! Guest directory - SQLite storage for guests, tables, and send state
//!
//! Shared with the admin web interface. The bot's writes are single-row
//! updates (the `message_sent` flag), last write wins.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS guest (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    phone TEXT NOT NULL,
    email TEXT,
    unique_token TEXT NOT NULL UNIQUE,
    invited_count INTEGER NOT NULL DEFAULT 1,
    confirmed_count INTEGER NOT NULL DEFAULT 0,
    group_affiliation TEXT,
    side TEXT,
    attendance_status TEXT NOT NULL DEFAULT 'pending',
    message_sent INTEGER NOT NULL DEFAULT 0,
    response_date TEXT,
    notes TEXT,
    table_number INTEGER,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS seating_table (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_number INTEGER NOT NULL UNIQUE,
    capacity INTEGER NOT NULL DEFAULT 8,
    description TEXT
);
"#;

const GUEST_COLUMNS: &str = "id, name, phone, email, unique_token, invited_count, confirmed_count, \
     group_affiliation, side, attendance_status, message_sent, response_date, notes, table_number, created_at";

/// RSVP answer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Pending,
    Attending,
    Undecided,
    Declined,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Pending => "pending",
            AttendanceStatus::Attending => "attending",
            AttendanceStatus::Undecided => "undecided",
            AttendanceStatus::Declined => "declined",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = Error;

    /// Accepts the English names and the Hebrew labels the admin UI writes
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" | "ממתין" => Ok(AttendanceStatus::Pending),
            "attending" | "יגיע" => Ok(AttendanceStatus::Attending),
            "undecided" | "מתלבט" => Ok(AttendanceStatus::Undecided),
            "declined" | "לא יגיע" => Ok(AttendanceStatus::Declined),
            other => Err(Error::Config(format!("unknown attendance status: {}", other))),
        }
    }
}

/// A guest record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Guest {
    pub id: i64,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub unique_token: String,
    pub invited_count: i64,
    pub confirmed_count: i64,
    pub group_affiliation: Option<String>,
    pub side: Option<String>,
    pub attendance_status: AttendanceStatus,
    pub message_sent: bool,
    pub response_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub table_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Guest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(9)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            phone: row.get(2)?,
            email: row.get(3)?,
            unique_token: row.get(4)?,
            invited_count: row.get(5)?,
            confirmed_count: row.get(6)?,
            group_affiliation: row.get(7)?,
            side: row.get(8)?,
            attendance_status: status.parse().unwrap_or(AttendanceStatus::Pending),
            message_sent: row.get(10)?,
            response_date: row.get(11)?,
            notes: row.get(12)?,
            table_number: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    pub fn has_responded(&self) -> bool {
        self.response_date.is_some()
    }
}

/// Fields for a new guest; everything else takes its default
#[derive(Debug, Clone, Default)]
pub struct NewGuest {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    /// Generated when absent
    pub unique_token: Option<String>,
    pub invited_count: Option<i64>,
    pub group_affiliation: Option<String>,
    pub side: Option<String>,
    pub notes: Option<String>,
}

impl NewGuest {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.unique_token = Some(token.into());
        self
    }

    pub fn with_invited_count(mut self, count: i64) -> Self {
        self.invited_count = Some(count);
        self
    }
}

/// A seating table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub id: i64,
    pub table_number: i64,
    pub capacity: i64,
    pub description: Option<String>,
}

/// Seat usage for one table; capacity is advisory only
#[derive(Debug, Clone, PartialEq)]
pub struct TableOccupancy {
    pub table: Table,
    pub guests: usize,
    pub seats_taken: i64,
}

impl TableOccupancy {
    pub fn over_capacity(&self) -> bool {
        self.seats_taken > self.table.capacity
    }
}

/// An RSVP reply as recorded by the web form
#[derive(Debug, Clone)]
pub struct RsvpResponse {
    pub status: AttendanceStatus,
    pub confirmed_count: i64,
    pub notes: Option<String>,
}

/// Headline numbers for the admin dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuestStats {
    pub total_guests: i64,
    pub invitations_sent: i64,
    pub attending: i64,
    pub declined: i64,
    pub pending_response: i64,
    pub total_attending: i64,
}

/// Generate an opaque invite token
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// SQLite-backed guest directory
pub struct Directory {
    conn: Connection,
}

impl Directory {
    /// Open (and create if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Throwaway database (tests, previews)
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert a guest and return the stored record
    pub fn add_guest(&self, guest: NewGuest) -> Result<Guest> {
        let token = guest.unique_token.unwrap_or_else(generate_token);
        self.conn.execute(
            "INSERT INTO guest (name, phone, email, unique_token, invited_count, group_affiliation, side, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                guest.name,
                guest.phone,
                guest.email,
                token,
                guest.invited_count.unwrap_or(1),
                guest.group_affiliation,
                guest.side,
                guest.notes,
                Utc::now(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_guest(id)?
            .ok_or_else(|| Error::GuestNotFound(id.to_string()))
    }

    pub fn get_guest(&self, id: i64) -> Result<Option<Guest>> {
        let sql = format!("SELECT {} FROM guest WHERE id = ?1", GUEST_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], Guest::from_row).optional()?)
    }

    pub fn guest_by_token(&self, token: &str) -> Result<Option<Guest>> {
        let sql = format!("SELECT {} FROM guest WHERE unique_token = ?1", GUEST_COLUMNS);
        Ok(self.conn.query_row(&sql, [token], Guest::from_row).optional()?)
    }

    /// All guests in id order
    pub fn list_guests(&self, limit: Option<usize>) -> Result<Vec<Guest>> {
        self.query_guests("1 = 1", limit)
    }

    /// Guests whose invitation has not been delivered and verified
    pub fn pending_invitations(&self, limit: Option<usize>) -> Result<Vec<Guest>> {
        self.query_guests("message_sent = 0", limit)
    }

    /// Invited guests that have not answered yet
    pub fn awaiting_response(&self, limit: Option<usize>) -> Result<Vec<Guest>> {
        self.query_guests("message_sent = 1 AND response_date IS NULL", limit)
    }

    fn query_guests(&self, filter: &str, limit: Option<usize>) -> Result<Vec<Guest>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {} FROM guest WHERE {} ORDER BY id ASC LIMIT ?1",
            GUEST_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], Guest::from_row)?;
        let mut guests = Vec::new();
        for row in rows {
            guests.push(row?);
        }
        Ok(guests)
    }

    /// Flip the send flag after a verified delivery
    pub fn mark_message_sent(&self, id: i64) -> Result<()> {
        let changed = self
            .conn
            .execute("UPDATE guest SET message_sent = 1 WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(Error::GuestNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Clear the send flag for every guest; returns the number of rows touched
    pub fn reset_message_sent(&self) -> Result<usize> {
        Ok(self.conn.execute("UPDATE guest SET message_sent = 0", [])?)
    }

    /// Store an RSVP reply and stamp the response time
    pub fn record_response(&self, token: &str, response: &RsvpResponse) -> Result<Guest> {
        let confirmed = if response.status == AttendanceStatus::Attending {
            response.confirmed_count.max(0)
        } else {
            0
        };
        let changed = self.conn.execute(
            "UPDATE guest SET attendance_status = ?1, confirmed_count = ?2, notes = COALESCE(?3, notes), response_date = ?4
             WHERE unique_token = ?5",
            params![response.status.as_str(), confirmed, response.notes, Utc::now(), token],
        )?;
        if changed == 0 {
            return Err(Error::GuestNotFound(token.to_string()));
        }
        self.guest_by_token(token)?
            .ok_or_else(|| Error::GuestNotFound(token.to_string()))
    }

    pub fn add_table(&self, table_number: i64, capacity: i64, description: Option<&str>) -> Result<Table> {
        self.conn.execute(
            "INSERT INTO seating_table (table_number, capacity, description) VALUES (?1, ?2, ?3)",
            params![table_number, capacity, description],
        )?;
        self.table(table_number)?
            .ok_or(Error::TableNotFound(table_number))
    }

    pub fn table(&self, table_number: i64) -> Result<Option<Table>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, table_number, capacity, description FROM seating_table WHERE table_number = ?1",
                [table_number],
                |row| {
                    Ok(Table {
                        id: row.get(0)?,
                        table_number: row.get(1)?,
                        capacity: row.get(2)?,
                        description: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Seat a guest; over-capacity assignments are allowed
    pub fn assign_table(&self, guest_id: i64, table_number: i64) -> Result<()> {
        if self.table(table_number)?.is_none() {
            return Err(Error::TableNotFound(table_number));
        }
        let changed = self.conn.execute(
            "UPDATE guest SET table_number = ?1 WHERE id = ?2",
            params![table_number, guest_id],
        )?;
        if changed == 0 {
            return Err(Error::GuestNotFound(guest_id.to_string()));
        }
        Ok(())
    }

    /// Per-table seat usage, counting confirmed heads of assigned guests
    pub fn table_occupancy(&self) -> Result<Vec<TableOccupancy>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.table_number, t.capacity, t.description,
                    COUNT(g.id), COALESCE(SUM(g.confirmed_count), 0)
             FROM seating_table t
             LEFT JOIN guest g ON g.table_number = t.table_number
             GROUP BY t.id
             ORDER BY t.table_number ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let guests: i64 = row.get(4)?;
            Ok(TableOccupancy {
                table: Table {
                    id: row.get(0)?,
                    table_number: row.get(1)?,
                    capacity: row.get(2)?,
                    description: row.get(3)?,
                },
                guests: guests as usize,
                seats_taken: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<GuestStats> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(message_sent), 0),
                    COALESCE(SUM(CASE WHEN attendance_status = 'attending' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN attendance_status = 'declined' AND response_date IS NOT NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN response_date IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN attendance_status = 'attending' THEN confirmed_count ELSE 0 END), 0)
             FROM guest",
            [],
            |row| {
                Ok(GuestStats {
                    total_guests: row.get(0)?,
                    invitations_sent: row.get(1)?,
                    attending: row.get(2)?,
                    declined: row.get(3)?,
                    pending_response: row.get(4)?,
                    total_attending: row.get(5)?,
                })
            },
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Directory {
        let dir = Directory::open_in_memory().unwrap();
        dir.add_guest(NewGuest::new("Dana", "0521112222").with_token("abc-123").with_invited_count(2))
            .unwrap();
        dir.add_guest(NewGuest::new("Moshe Cohen", "+972501234567").with_invited_count(4))
            .unwrap();
        dir.add_guest(NewGuest::new("Sara Levi", "050-234-5678")).unwrap();
        dir
    }

    #[test]
    fn test_add_and_get_guest() {
        let dir = seeded();
        let dana = dir.get_guest(1).unwrap().unwrap();
        assert_eq!(dana.name, "Dana");
        assert_eq!(dana.unique_token, "abc-123");
        assert_eq!(dana.invited_count, 2);
        assert_eq!(dana.attendance_status, AttendanceStatus::Pending);
        assert!(!dana.message_sent);
        assert!(dana.response_date.is_none());

        assert!(dir.get_guest(99).unwrap().is_none());
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let dir = seeded();
        let guests = dir.list_guests(None).unwrap();
        assert_eq!(guests[1].unique_token.len(), 32);
        assert_ne!(guests[1].unique_token, guests[2].unique_token);
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let dir = seeded();
        let result = dir.add_guest(NewGuest::new("Copy", "0500000000").with_token("abc-123"));
        assert!(matches!(result, Err(Error::Sqlite(_))));
    }

    #[test]
    fn test_pending_and_awaiting_selection() {
        let dir = seeded();
        assert_eq!(dir.pending_invitations(None).unwrap().len(), 3);
        assert_eq!(dir.pending_invitations(Some(2)).unwrap().len(), 2);
        assert!(dir.awaiting_response(None).unwrap().is_empty());

        dir.mark_message_sent(1).unwrap();
        dir.mark_message_sent(2).unwrap();
        dir.record_response(
            "abc-123",
            &RsvpResponse {
                status: AttendanceStatus::Attending,
                confirmed_count: 2,
                notes: None,
            },
        )
        .unwrap();

        let pending: Vec<i64> = dir.pending_invitations(None).unwrap().iter().map(|g| g.id).collect();
        assert_eq!(pending, vec![3]);
        let awaiting: Vec<i64> = dir.awaiting_response(None).unwrap().iter().map(|g| g.id).collect();
        assert_eq!(awaiting, vec![2]);
    }

    #[test]
    fn test_mark_unknown_guest() {
        let dir = seeded();
        assert!(matches!(dir.mark_message_sent(42), Err(Error::GuestNotFound(_))));
    }

    #[test]
    fn test_reset_message_sent() {
        let dir = seeded();
        dir.mark_message_sent(1).unwrap();
        dir.mark_message_sent(3).unwrap();
        assert_eq!(dir.reset_message_sent().unwrap(), 3);
        assert_eq!(dir.pending_invitations(None).unwrap().len(), 3);
    }

    #[test]
    fn test_declined_response_zeroes_count() {
        let dir = seeded();
        let guest = dir
            .record_response(
                "abc-123",
                &RsvpResponse {
                    status: AttendanceStatus::Declined,
                    confirmed_count: 3,
                    notes: Some("abroad".into()),
                },
            )
            .unwrap();
        assert_eq!(guest.confirmed_count, 0);
        assert_eq!(guest.notes.as_deref(), Some("abroad"));
        assert!(guest.has_responded());
    }

    #[test]
    fn test_tables_and_occupancy() {
        let dir = seeded();
        dir.add_table(1, 2, Some("family")).unwrap();
        dir.add_table(2, 8, None).unwrap();
        dir.record_response(
            "abc-123",
            &RsvpResponse {
                status: AttendanceStatus::Attending,
                confirmed_count: 3,
                notes: None,
            },
        )
        .unwrap();
        dir.assign_table(1, 1).unwrap();
        dir.assign_table(2, 1).unwrap();

        assert!(matches!(dir.assign_table(1, 9), Err(Error::TableNotFound(9))));
        assert!(matches!(dir.assign_table(77, 1), Err(Error::GuestNotFound(_))));

        let occupancy = dir.table_occupancy().unwrap();
        assert_eq!(occupancy.len(), 2);
        assert_eq!(occupancy[0].guests, 2);
        assert_eq!(occupancy[0].seats_taken, 3);
        assert!(occupancy[0].over_capacity());
        assert_eq!(occupancy[1].guests, 0);
        assert!(!occupancy[1].over_capacity());
    }

    #[test]
    fn test_stats() {
        let dir = seeded();
        dir.mark_message_sent(1).unwrap();
        dir.mark_message_sent(2).unwrap();
        dir.record_response(
            "abc-123",
            &RsvpResponse {
                status: AttendanceStatus::Attending,
                confirmed_count: 2,
                notes: None,
            },
        )
        .unwrap();
        let moshe = dir.get_guest(2).unwrap().unwrap();
        dir.record_response(
            &moshe.unique_token,
            &RsvpResponse {
                status: AttendanceStatus::Declined,
                confirmed_count: 0,
                notes: None,
            },
        )
        .unwrap();

        let stats = dir.stats().unwrap();
        assert_eq!(stats.total_guests, 3);
        assert_eq!(stats.invitations_sent, 2);
        assert_eq!(stats.attending, 1);
        assert_eq!(stats.declined, 1);
        assert_eq!(stats.pending_response, 1);
        assert_eq!(stats.total_attending, 2);
    }

    #[test]
    fn test_attendance_status_parsing() {
        assert_eq!("attending".parse::<AttendanceStatus>().unwrap(), AttendanceStatus::Attending);
        assert_eq!("ממתין".parse::<AttendanceStatus>().unwrap(), AttendanceStatus::Pending);
        assert_eq!("לא יגיע".parse::<AttendanceStatus>().unwrap(), AttendanceStatus::Declined);
        assert!("maybe".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn test_open_on_disk_persists() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nested/wedding.db");
        {
            let dir = Directory::open(&path).unwrap();
            dir.add_guest(NewGuest::new("Dana", "0521112222")).unwrap();
        }
        let dir = Directory::open(&path).unwrap();
        assert_eq!(dir.list_guests(None).unwrap().len(), 1);
    }
}

use crate::error::{AppError, AppResult};
use crate::models::*;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-backed record store shared by the dispatcher, the reply interpreter
/// and the HTTP layer. The connection lock is held for one statement or one
/// transaction at a time.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> AppResult<Self> {
        log::info!("[DB] opening {:?}", path);
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> AppResult<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Custom("Database lock error".to_string()))
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn create_tables(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS patients (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_patients_phone ON patients(phone);

        CREATE TABLE IF NOT EXISTS medications (
            id TEXT PRIMARY KEY,
            patient_id TEXT NOT NULL,
            name TEXT NOT NULL,
            dosage TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            days TEXT NOT NULL,
            times TEXT NOT NULL,
            created_at TEXT NOT NULL,
            deactivated_at TEXT,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );
        CREATE INDEX IF NOT EXISTS idx_medications_patient ON medications(patient_id);
        CREATE INDEX IF NOT EXISTS idx_medications_active ON medications(active);

        CREATE TABLE IF NOT EXISTS reminders (
            id TEXT PRIMARY KEY,
            medication_id TEXT NOT NULL,
            patient_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 1,
            scheduled_time TEXT NOT NULL,
            message_sid TEXT,
            delivery_status TEXT,
            response_code TEXT,
            responded_at TEXT,
            postpone_count INTEGER,
            delay_minutes INTEGER,
            due_at TEXT,
            error_detail TEXT,
            FOREIGN KEY (medication_id) REFERENCES medications(id),
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );
        CREATE INDEX IF NOT EXISTS idx_reminders_patient_status ON reminders(patient_id, status, created_at);
        CREATE INDEX IF NOT EXISTS idx_reminders_status_due ON reminders(status, due_at);
        "#,
    )?;
    Ok(())
}

// ============ Patients ============

const PATIENT_COLUMNS: &str = "id, name, phone, created_at";

fn map_patient_row(row: &Row) -> rusqlite::Result<Patient> {
    Ok(Patient {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        created_at: parse_ts(&row.get::<_, String>(3)?)?,
    })
}

fn insert_patient(conn: &Connection, patient: &Patient) -> AppResult<()> {
    conn.execute(
        "INSERT INTO patients (id, name, phone, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![patient.id, patient.name, patient.phone, ts(&patient.created_at)],
    )?;
    Ok(())
}

impl Database {
    pub fn get_patient(&self, id: &str) -> AppResult<Option<Patient>> {
        let conn = self.conn()?;
        let patient = conn
            .query_row(
                &format!("SELECT {} FROM patients WHERE id = ?1", PATIENT_COLUMNS),
                [id],
                map_patient_row,
            )
            .optional()?;
        Ok(patient)
    }

    /// Earliest registration wins when a number was registered twice.
    pub fn find_patient_by_phone(&self, phone: &str) -> AppResult<Option<Patient>> {
        let conn = self.conn()?;
        let patient = conn
            .query_row(
                &format!(
                    "SELECT {} FROM patients WHERE phone = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                    PATIENT_COLUMNS
                ),
                [phone],
                map_patient_row,
            )
            .optional()?;
        Ok(patient)
    }
}

// ============ Medications ============

const MEDICATION_COLUMNS: &str =
    "id, patient_id, name, dosage, active, days, times, created_at, deactivated_at";

fn map_medication_row(row: &Row) -> rusqlite::Result<Medication> {
    Ok(Medication {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        name: row.get(2)?,
        dosage: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        days: parse_json(&row.get::<_, String>(5)?)?,
        times: parse_json(&row.get::<_, String>(6)?)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        deactivated_at: parse_opt_ts(row.get(8)?)?,
    })
}

fn insert_medication(conn: &Connection, medication: &Medication) -> AppResult<()> {
    conn.execute(
        r#"INSERT INTO medications
           (id, patient_id, name, dosage, active, days, times, created_at, deactivated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        params![
            medication.id,
            medication.patient_id,
            medication.name,
            medication.dosage,
            medication.active,
            serde_json::to_string(&medication.days)?,
            serde_json::to_string(&medication.times)?,
            ts(&medication.created_at),
            medication.deactivated_at.as_ref().map(ts),
        ],
    )?;
    Ok(())
}

impl Database {
    /// Patient and medications in one transaction.
    pub fn register_patient(&self, patient: &Patient, medications: &[Medication]) -> AppResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        insert_patient(&tx, patient)?;
        for medication in medications {
            insert_medication(&tx, medication)?;
        }
        tx.commit()?;

        log::info!(
            "Patient registered: {} with {} medications",
            patient.id,
            medications.len()
        );
        Ok(())
    }

    pub fn get_medication(&self, id: &str) -> AppResult<Option<Medication>> {
        let conn = self.conn()?;
        let medication = conn
            .query_row(
                &format!("SELECT {} FROM medications WHERE id = ?1", MEDICATION_COLUMNS),
                [id],
                map_medication_row,
            )
            .optional()?;
        Ok(medication)
    }

    pub fn list_active_medications(&self) -> AppResult<Vec<Medication>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM medications WHERE active = 1 ORDER BY created_at ASC, rowid ASC",
            MEDICATION_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_medication_row)?;

        let mut medications = Vec::new();
        for row in rows {
            medications.push(row?);
        }
        Ok(medications)
    }

    pub fn get_medications_by_patient(&self, patient_id: &str) -> AppResult<Vec<Medication>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM medications WHERE patient_id = ?1 ORDER BY created_at ASC, rowid ASC",
            MEDICATION_COLUMNS
        ))?;
        let rows = stmt.query_map([patient_id], map_medication_row)?;

        let mut medications = Vec::new();
        for row in rows {
            medications.push(row?);
        }
        Ok(medications)
    }

    /// Deactivates every active medication of the patient in one transaction.
    /// Returns how many were switched off.
    pub fn deactivate_medications(&self, patient_id: &str, at: DateTime<Utc>) -> AppResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM medications WHERE patient_id = ?1 AND active = 1")?;
            let rows = stmt.query_map([patient_id], |row| row.get(0))?;
            let ids = rows.collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };

        let stamp = ts(&at);
        for id in &ids {
            tx.execute(
                "UPDATE medications SET active = 0, deactivated_at = ?2 WHERE id = ?1",
                params![id, stamp],
            )?;
        }
        tx.commit()?;

        log::info!("Deactivated {} medications for patient {}", ids.len(), patient_id);
        Ok(ids.len())
    }
}

// ============ Reminders ============

const REMINDER_COLUMNS: &str = "id, medication_id, patient_id, created_at, status, attempt, scheduled_time, \
     message_sid, delivery_status, response_code, responded_at, postpone_count, delay_minutes, due_at, error_detail";

fn map_reminder_row(row: &Row) -> rusqlite::Result<ReminderInstance> {
    let status: String = row.get(4)?;
    Ok(ReminderInstance {
        id: row.get(0)?,
        medication_id: row.get(1)?,
        patient_id: row.get(2)?,
        created_at: parse_ts(&row.get::<_, String>(3)?)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        attempt: row.get(5)?,
        scheduled_time: row.get(6)?,
        message_sid: row.get(7)?,
        delivery_status: row.get(8)?,
        response_code: row.get(9)?,
        responded_at: parse_opt_ts(row.get(10)?)?,
        postpone_count: row.get(11)?,
        delay_minutes: row.get(12)?,
        due_at: parse_opt_ts(row.get(13)?)?,
        error_detail: row.get(14)?,
    })
}

fn insert_reminder(conn: &Connection, reminder: &ReminderInstance) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO reminders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            REMINDER_COLUMNS
        ),
        params![
            reminder.id,
            reminder.medication_id,
            reminder.patient_id,
            ts(&reminder.created_at),
            reminder.status.as_str(),
            reminder.attempt,
            reminder.scheduled_time,
            reminder.message_sid,
            reminder.delivery_status,
            reminder.response_code,
            reminder.responded_at.as_ref().map(ts),
            reminder.postpone_count,
            reminder.delay_minutes,
            reminder.due_at.as_ref().map(ts),
            reminder.error_detail,
        ],
    )
}

impl Database {
    pub fn insert_reminder(&self, reminder: &ReminderInstance) -> AppResult<()> {
        let conn = self.conn()?;
        insert_reminder(&conn, reminder)?;
        log::debug!("Reminder stored: {} ({})", reminder.id, reminder.status);
        Ok(())
    }

    /// Inserts new reminders and marks promoted ones as sent, all or nothing.
    /// Returns the ids of promoted reminders that were still
    /// `scheduled_postponed`.
    pub fn commit_reminder_batch(
        &self,
        created: &[ReminderInstance],
        promoted: &[ReminderInstance],
    ) -> AppResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for reminder in created {
            insert_reminder(&tx, reminder)?;
        }
        let mut applied = Vec::with_capacity(promoted.len());
        for reminder in promoted {
            let count = tx.execute(
                r#"UPDATE reminders SET status = ?2, attempt = ?3, created_at = ?4
                   WHERE id = ?1 AND status = ?5"#,
                params![
                    reminder.id,
                    reminder.status.as_str(),
                    reminder.attempt,
                    ts(&reminder.created_at),
                    ReminderStatus::ScheduledPostponed.as_str(),
                ],
            )?;
            if count > 0 {
                applied.push(reminder.id.clone());
            }
        }
        tx.commit()?;

        log::debug!(
            "Reminder batch committed: {} created, {} of {} promoted",
            created.len(),
            applied.len(),
            promoted.len()
        );
        Ok(applied)
    }

    pub fn get_reminder(&self, id: &str) -> AppResult<Option<ReminderInstance>> {
        let conn = self.conn()?;
        let reminder = conn
            .query_row(
                &format!("SELECT {} FROM reminders WHERE id = ?1", REMINDER_COLUMNS),
                [id],
                map_reminder_row,
            )
            .optional()?;
        Ok(reminder)
    }

    pub fn mark_delivered(&self, id: &str, message_sid: &str, delivery_status: &str) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE reminders SET message_sid = ?2, delivery_status = ?3 WHERE id = ?1",
            params![id, message_sid, delivery_status],
        )?;
        Ok(())
    }

    pub fn mark_delivery_failed(&self, id: &str, detail: &str) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE reminders SET status = ?2, error_detail = ?3 WHERE id = ?1",
            params![id, ReminderStatus::Error.as_str(), detail],
        )?;
        Ok(())
    }

    /// Applies a reply-driven status change only while the reminder is still
    /// `sent`. Returns false when nothing was updated.
    pub fn update_reminder_response(
        &self,
        id: &str,
        status: ReminderStatus,
        response_code: &str,
        responded_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let conn = self.conn()?;
        let count = conn.execute(
            r#"UPDATE reminders SET status = ?2, response_code = ?3, responded_at = ?4
               WHERE id = ?1 AND status = ?5"#,
            params![
                id,
                status.as_str(),
                response_code,
                ts(&responded_at),
                ReminderStatus::Sent.as_str(),
            ],
        )?;
        Ok(count > 0)
    }

    /// Newest reminder in `status` for the patient; ties go to the later insert.
    pub fn latest_reminder_with_status(
        &self,
        patient_id: &str,
        status: ReminderStatus,
    ) -> AppResult<Option<ReminderInstance>> {
        let conn = self.conn()?;
        let reminder = conn
            .query_row(
                &format!(
                    "SELECT {} FROM reminders WHERE patient_id = ?1 AND status = ?2 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    REMINDER_COLUMNS
                ),
                params![patient_id, status.as_str()],
                map_reminder_row,
            )
            .optional()?;
        Ok(reminder)
    }

    pub fn list_due_postponed(&self, now: DateTime<Utc>) -> AppResult<Vec<ReminderInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM reminders WHERE status = ?1 AND due_at IS NOT NULL AND due_at <= ?2 \
             ORDER BY due_at ASC, rowid ASC",
            REMINDER_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![ReminderStatus::ScheduledPostponed.as_str(), ts(&now)],
            map_reminder_row,
        )?;

        let mut reminders = Vec::new();
        for row in rows {
            reminders.push(row?);
        }
        Ok(reminders)
    }

    pub fn list_reminders_by_patient(&self, patient_id: &str) -> AppResult<Vec<ReminderInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM reminders WHERE patient_id = ?1 ORDER BY created_at ASC, rowid ASC",
            REMINDER_COLUMNS
        ))?;
        let rows = stmt.query_map([patient_id], map_reminder_row)?;

        let mut reminders = Vec::new();
        for row in rows {
            reminders.push(row?);
        }
        Ok(reminders)
    }

    /// Tally of reminders created during the given local day.
    pub fn daily_report(&self, patient_id: &str, date: NaiveDate, tz: Tz) -> AppResult<AdherenceReport> {
        let (start, end) = local_day_bounds(date, tz)?;
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"SELECT status, COUNT(*) FROM reminders
               WHERE patient_id = ?1 AND created_at >= ?2 AND created_at < ?3
               GROUP BY status"#,
        )?;
        let rows = stmt.query_map(params![patient_id, ts(&start), ts(&end)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut report = AdherenceReport::empty(patient_id, date);
        for row in rows {
            let (status, count) = row?;
            match status.parse::<ReminderStatus>() {
                Ok(status) => report.add(status, count),
                Err(e) => log::warn!("Skipping reminders with {}", e),
            }
        }
        Ok(report)
    }
}

/// UTC half-open range [start, end) covering a local calendar day.
fn local_day_bounds(date: NaiveDate, tz: Tz) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
    let next = date
        .succ_opt()
        .ok_or_else(|| AppError::InvalidInput(format!("date out of range: {}", date)))?;
    let start_of = |day: NaiveDate| -> AppResult<DateTime<Utc>> {
        let midnight = day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid date: {}", day)))?;
        tz.from_local_datetime(&midnight)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| AppError::InvalidInput(format!("no local midnight on {}", day)))
    };
    Ok((start_of(date)?, start_of(next)?))
}

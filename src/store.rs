// src/store.rs

use crate::types::{AccountRecord, AmountFormat, CsvParsingRules, CsvRuleProposal, UsageEvent};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

/// SQLite-backed store for parsing rules, extraction templates,
/// historical accounts and the usage ledger.
///
/// Rule-set creation is append-only and keyed by (owner, bank id,
/// creation time); only the usage counter is ever mutated in place.
pub struct ScanStore {
    conn: Connection,
}

impl ScanStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS csv_parsing_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                bank_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                header_row INTEGER NOT NULL DEFAULT 0,
                data_start_row INTEGER NOT NULL DEFAULT 1,
                date_column TEXT,
                description_column TEXT,
                amount_column TEXT,
                debit_column TEXT,
                credit_column TEXT,
                balance_column TEXT,
                reference_column TEXT,
                date_format TEXT,
                amount_format TEXT NOT NULL DEFAULT 'signed',
                debit_credit_strategy TEXT,
                thousands_separator TEXT,
                decimal_separator TEXT,
                sample_header TEXT,
                sample_row TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                use_count INTEGER NOT NULL DEFAULT 0,
                confirmed INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS extraction_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                bank_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                bank_name TEXT NOT NULL,
                account_suffix TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner, bank_name, account_suffix)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_events (
                uid TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                operation TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rules_owner_bank
             ON csv_parsing_rules(owner, bank_id, confirmed)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_templates_owner_bank
             ON extraction_templates(owner, bank_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner)",
            [],
        )?;

        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    /// Generate a unique, deterministic ID for a usage event.
    pub fn generate_event_uid(owner: &str, operation: &str, created_at: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(owner.as_bytes());
        hasher.update(operation.as_bytes());
        hasher.update(created_at.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    // -----------------------------------------------------------------
    // CSV parsing rule cache
    // -----------------------------------------------------------------

    /// Most recent confirmed rule set for (owner, bank), or none.
    /// Unconfirmed proposals never participate in lookups.
    pub fn find_rules(&self, owner: &str, bank_id: &str) -> SqliteResult<Option<CsvParsingRules>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner, bank_id, display_name, header_row, data_start_row,
                    date_column, description_column, amount_column, debit_column, credit_column,
                    balance_column, reference_column, date_format, amount_format,
                    debit_credit_strategy, thousands_separator, decimal_separator,
                    sample_header, sample_row, created_by, created_at, use_count, confirmed
             FROM csv_parsing_rules
             WHERE owner = ?1 AND bank_id = ?2 AND confirmed = 1
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )?;
        stmt.query_row(params![owner, bank_id], Self::row_to_rules)
            .optional()
    }

    /// Persist a model-proposed rule set as a fresh, unconfirmed
    /// candidate. Append-only; returns the new row id.
    #[allow(clippy::too_many_arguments)]
    pub fn save_rules(
        &self,
        owner: &str,
        bank_id: &str,
        display_name: &str,
        proposal: &CsvRuleProposal,
        sample_header: Option<&str>,
        sample_row: Option<&str>,
        created_by: &str,
    ) -> SqliteResult<i64> {
        let created_at = Utc::now().to_rfc3339();
        let amount_format = match proposal.amount_format.unwrap_or(AmountFormat::Signed) {
            AmountFormat::Signed => "signed",
            AmountFormat::Absolute => "absolute",
        };
        self.conn.execute(
            "INSERT INTO csv_parsing_rules
                (owner, bank_id, display_name, header_row, data_start_row,
                 date_column, description_column, amount_column, debit_column, credit_column,
                 balance_column, reference_column, date_format, amount_format,
                 debit_credit_strategy, thousands_separator, decimal_separator,
                 sample_header, sample_row, created_by, created_at, use_count, confirmed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, 0, 0)",
            params![
                owner,
                bank_id,
                display_name,
                proposal.header_row.unwrap_or(0),
                proposal.data_start_row.unwrap_or(1),
                proposal.date_column,
                proposal.description_column,
                proposal.amount_column,
                proposal.debit_column,
                proposal.credit_column,
                proposal.balance_column,
                proposal.reference_column,
                proposal.date_format,
                amount_format,
                proposal.debit_credit_strategy,
                proposal.thousands_separator,
                proposal.decimal_separator,
                sample_header,
                sample_row,
                created_by,
                created_at,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(rule_id = id, owner = %owner, bank_id = %bank_id, "New parsing rule proposal stored");
        Ok(id)
    }

    /// Fetch one rule set by id, confirmed or not.
    pub fn get_rules(&self, id: i64) -> SqliteResult<Option<CsvParsingRules>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner, bank_id, display_name, header_row, data_start_row,
                    date_column, description_column, amount_column, debit_column, credit_column,
                    balance_column, reference_column, date_format, amount_format,
                    debit_credit_strategy, thousands_separator, decimal_separator,
                    sample_header, sample_row, created_by, created_at, use_count, confirmed
             FROM csv_parsing_rules
             WHERE id = ?1",
        )?;
        stmt.query_row(params![id], Self::row_to_rules).optional()
    }

    /// Hook used by the external confirmation workflow: make a stored
    /// proposal authoritative for future lookups.
    pub fn confirm_rules(&self, id: i64) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE csv_parsing_rules SET confirmed = 1 WHERE id = ?1",
            params![id],
        )?;
        info!(rule_id = id, "Parsing rule set confirmed");
        Ok(())
    }

    /// Bump the usage counter after a successful reuse.
    pub fn increment_rule_usage(&self, id: i64) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE csv_parsing_rules SET use_count = use_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Total stored rule sets for (owner, bank), confirmed or not.
    pub fn count_rules(&self, owner: &str, bank_id: &str) -> SqliteResult<u32> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM csv_parsing_rules WHERE owner = ?1 AND bank_id = ?2",
            params![owner, bank_id],
            |row| row.get(0),
        )
    }

    fn row_to_rules(row: &rusqlite::Row<'_>) -> rusqlite::Result<CsvParsingRules> {
        let amount_format: String = row.get(14)?;
        Ok(CsvParsingRules {
            id: row.get(0)?,
            owner: row.get(1)?,
            bank_id: row.get(2)?,
            display_name: row.get(3)?,
            header_row: row.get::<_, i64>(4)? as usize,
            data_start_row: row.get::<_, i64>(5)? as usize,
            date_column: row.get(6)?,
            description_column: row.get(7)?,
            amount_column: row.get(8)?,
            debit_column: row.get(9)?,
            credit_column: row.get(10)?,
            balance_column: row.get(11)?,
            reference_column: row.get(12)?,
            date_format: row.get(13)?,
            amount_format: if amount_format == "absolute" {
                AmountFormat::Absolute
            } else {
                AmountFormat::Signed
            },
            debit_credit_strategy: row.get(15)?,
            thousands_separator: row.get(16)?,
            decimal_separator: row.get(17)?,
            sample_header: row.get(18)?,
            sample_row: row.get(19)?,
            created_by: row.get(20)?,
            created_at: row.get(21)?,
            use_count: row.get::<_, i64>(22)? as u32,
            confirmed: row.get::<_, i64>(23)? != 0,
        })
    }

    // -----------------------------------------------------------------
    // Extraction templates (read-only from the scan path)
    // -----------------------------------------------------------------

    /// First confirmed template for (owner, bank), if any. No ranking
    /// or fuzzy matching; first match wins.
    pub fn find_template(&self, owner: &str, bank_id: &str) -> SqliteResult<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM extraction_templates
                 WHERE owner = ?1 AND bank_id = ?2
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1",
                params![owner, bank_id],
                |row| row.get(0),
            )
            .optional()
    }

    /// Write path used by the template-management surface (and tests).
    pub fn insert_template(&self, owner: &str, bank_id: &str, name: &str) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO extraction_templates (owner, bank_id, name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![owner, bank_id, name, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // -----------------------------------------------------------------
    // Historical accounts
    // -----------------------------------------------------------------

    /// All of an owner's known accounts, most recently updated first.
    pub fn find_accounts_by_owner(&self, owner: &str) -> SqliteResult<Vec<AccountRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT bank_name, account_suffix FROM accounts
             WHERE owner = ?1
             ORDER BY updated_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![owner], |row| {
            Ok(AccountRecord {
                bank_name: row.get(0)?,
                account_suffix: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    pub fn upsert_account(&self, owner: &str, bank_name: &str, suffix: &str) -> SqliteResult<()> {
        self.upsert_account_at(owner, bank_name, suffix, &Utc::now().to_rfc3339())
    }

    pub fn upsert_account_at(
        &self,
        owner: &str,
        bank_name: &str,
        suffix: &str,
        updated_at: &str,
    ) -> SqliteResult<()> {
        self.conn.execute(
            "INSERT INTO accounts (owner, bank_name, account_suffix, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner, bank_name, account_suffix) DO UPDATE SET
                updated_at = excluded.updated_at",
            params![owner, bank_name, suffix, updated_at],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Usage ledger (append-only sink)
    // -----------------------------------------------------------------

    pub fn record_usage(&self, event: &UsageEvent) -> SqliteResult<()> {
        let created_at = Utc::now().to_rfc3339();
        let uid = Self::generate_event_uid(&event.owner, &event.operation, &created_at);
        self.conn.execute(
            "INSERT OR IGNORE INTO usage_events
                (uid, owner, operation, model, prompt_tokens, completion_tokens,
                 duration_ms, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                uid,
                event.owner,
                event.operation,
                event.model,
                event.prompt_tokens,
                event.completion_tokens,
                event.duration_ms as i64,
                event.outcome,
                created_at,
            ],
        )?;
        info!(
            owner = %event.owner,
            operation = %event.operation,
            outcome = %event.outcome,
            duration_ms = event.duration_ms,
            "Usage recorded"
        );
        Ok(())
    }

    pub fn count_usage_events(&self, owner: &str) -> SqliteResult<u32> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM usage_events WHERE owner = ?1",
            params![owner],
            |row| row.get(0),
        )
    }
}

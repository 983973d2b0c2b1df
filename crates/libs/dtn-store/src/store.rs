//! The narrow `Bundles`/`Registrations`/`Globals` key-value abstraction
//! from §4.2, plus a `rusqlite`-backed implementation.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Table {
    Bundles,
    Registrations,
    Globals,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Bundles => "bundles",
            Table::Registrations => "registrations",
            Table::Globals => "globals",
        }
    }
}

/// Schema version written to `Globals` and checked on open (§4.2). Bump
/// whenever the stored row encoding changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;
const SCHEMA_VERSION_KEY: &str = "__schema_version";

pub struct StoreConfig {
    pub dbdir: std::path::PathBuf,
    pub dbname: String,
    /// When true, tables are (re)created from scratch even if a mismatched
    /// schema version is found, matching the `storage set init` command.
    pub init: bool,
}

/// A transaction handle. Operations are buffered and applied atomically on
/// `commit`; dropping without committing is equivalent to `abort`.
pub struct Tx<'a> {
    inner: rusqlite::Transaction<'a>,
}

impl<'a> Tx<'a> {
    pub fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner.execute(
            &format!(
                "INSERT INTO {t} (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                t = table.name()
            ),
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner
            .query_row(
                &format!("SELECT value FROM {t} WHERE key = ?1", t = table.name()),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn del(&self, table: Table, key: &[u8]) -> Result<(), StoreError> {
        self.inner
            .execute(&format!("DELETE FROM {t} WHERE key = ?1", t = table.name()), params![key])?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.inner.commit()?;
        Ok(())
    }

    pub fn abort(self) -> Result<(), StoreError> {
        self.inner.rollback()?;
        Ok(())
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (creating if absent) the sqlite-backed store at
    /// `config.dbdir/config.dbname`. A schema-version mismatch is fatal
    /// unless `config.init` is set, in which case all tables are dropped
    /// and recreated (§4.2).
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.dbdir)?;
        let path = config.dbdir.join(&config.dbname);
        let conn = Connection::open(path)?;
        let store = SqliteStore { conn };
        store.ensure_schema(config.init)?;
        Ok(store)
    }

    /// An in-memory store, useful for tests (grounded on the `tempfile`
    /// scratch-dir convention the teacher uses rather than a bespoke mock).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore { conn };
        store.create_tables()?;
        store.write_schema_version()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        for table in [Table::Bundles, Table::Registrations, Table::Globals] {
            self.conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {t} (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
                    t = table.name()
                ),
                [],
            )?;
        }
        Ok(())
    }

    fn write_schema_version(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO globals (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION_KEY.as_bytes(), SCHEMA_VERSION.to_be_bytes()],
        )?;
        Ok(())
    }

    fn ensure_schema(&self, init: bool) -> Result<(), StoreError> {
        self.create_tables()?;
        let on_disk: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM globals WHERE key = ?1",
                params![SCHEMA_VERSION_KEY.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        match on_disk {
            None => self.write_schema_version(),
            Some(bytes) if bytes.len() == 4 => {
                let on_disk = u32::from_be_bytes(bytes.try_into().unwrap());
                if on_disk == SCHEMA_VERSION {
                    Ok(())
                } else if init {
                    log::warn!(
                        "store: schema mismatch (on-disk {on_disk}, expected {SCHEMA_VERSION}); \
                         reinitializing tables as requested"
                    );
                    for table in [Table::Bundles, Table::Registrations, Table::Globals] {
                        self.conn.execute(&format!("DROP TABLE {t}", t = table.name()), [])?;
                    }
                    self.create_tables()?;
                    self.write_schema_version()
                } else {
                    Err(StoreError::SchemaMismatch { on_disk, expected: SCHEMA_VERSION })
                }
            }
            Some(_) => Err(StoreError::SchemaMismatch { on_disk: 0, expected: SCHEMA_VERSION }),
        }
    }

    pub fn begin_tx(&mut self) -> Result<Tx<'_>, StoreError> {
        Ok(Tx { inner: self.conn.transaction()? })
    }

    pub fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let tx = self.begin_tx()?;
        tx.put(table, key, value)?;
        tx.commit()
    }

    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT value FROM {t} WHERE key = ?1", t = table.name()),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn del(&mut self, table: Table, key: &[u8]) -> Result<(), StoreError> {
        let tx = self.begin_tx()?;
        tx.del(table, key)?;
        tx.commit()
    }

    pub fn iter(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut stmt =
            self.conn.prepare(&format!("SELECT key, value FROM {t}", t = table.name()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub fn verify_payload_file(path: &Path, expected_len: u64) -> Result<(), StoreError> {
    let meta = std::fs::metadata(path).ok();
    let found = meta.as_ref().map(|m| m.len());
    if found != Some(expected_len) {
        return Err(StoreError::PayloadMismatch {
            bundle_id: 0,
            expected: expected_len,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_del_round_trip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.put(Table::Bundles, b"k1", b"v1").unwrap();
        assert_eq!(store.get(Table::Bundles, b"k1").unwrap(), Some(b"v1".to_vec()));
        store.del(Table::Bundles, b"k1").unwrap();
        assert_eq!(store.get(Table::Bundles, b"k1").unwrap(), None);
    }

    #[test]
    fn iter_returns_all_rows() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.put(Table::Registrations, b"a", b"1").unwrap();
        store.put(Table::Registrations, b"b", b"2").unwrap();
        let mut rows = store.iter(Table::Registrations).unwrap();
        rows.sort();
        assert_eq!(rows, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn aborted_tx_does_not_persist() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        {
            let tx = store.begin_tx().unwrap();
            tx.put(Table::Globals, b"x", b"y").unwrap();
            tx.abort().unwrap();
        }
        assert_eq!(store.get(Table::Globals, b"x").unwrap(), None);
    }

    #[test]
    fn schema_mismatch_is_fatal_without_init() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            StoreConfig { dbdir: dir.path().to_path_buf(), dbname: "test.db".into(), init: false };
        {
            let store = SqliteStore::open(&config).unwrap();
            drop(store);
        }
        // Tamper with the stored schema version directly.
        {
            let conn = Connection::open(dir.path().join("test.db")).unwrap();
            conn.execute(
                "UPDATE globals SET value = ?1 WHERE key = ?2",
                params![99u32.to_be_bytes(), SCHEMA_VERSION_KEY.as_bytes()],
            )
            .unwrap();
        }
        let err = SqliteStore::open(&config).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { on_disk: 99, .. }));
    }

    #[test]
    fn init_reinitializes_mismatched_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            StoreConfig { dbdir: dir.path().to_path_buf(), dbname: "test.db".into(), init: false };
        {
            let mut store = SqliteStore::open(&config).unwrap();
            store.put(Table::Bundles, b"stale", b"data").unwrap();
        }
        {
            let conn = Connection::open(dir.path().join("test.db")).unwrap();
            conn.execute(
                "UPDATE globals SET value = ?1 WHERE key = ?2",
                params![99u32.to_be_bytes(), SCHEMA_VERSION_KEY.as_bytes()],
            )
            .unwrap();
        }
        let init_config = StoreConfig { init: true, ..config };
        let store = SqliteStore::open(&init_config).unwrap();
        assert_eq!(store.get(Table::Bundles, b"stale").unwrap(), None);
    }
}

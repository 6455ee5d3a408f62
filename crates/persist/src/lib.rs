//! Strata persistence: write-through SQLite backend for committed objects.
//! Synchronous and small; the store calls it inside the per-key section.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

/// One committed object as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Canonical object key (`group/version/kind/account/name`).
    pub key: String,
    /// Creation sequence, used to restore list order.
    pub seq: u64,
    pub revision: u64,
    /// Serialized JSON object.
    pub data: Vec<u8>,
}

pub trait Backend: Send + Sync {
    fn put(&self, rec: &Record) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Every record, in creation order.
    fn load_all(&self) -> Result<Vec<Record>>;
}

pub struct SqliteBackend {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("STRATA_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                key      TEXT PRIMARY KEY,
                seq      INTEGER NOT NULL,
                revision INTEGER NOT NULL,
                data     BLOB NOT NULL
            )",
            [],
        )
        .context("creating objects table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_objects_seq ON objects(seq)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

impl Backend for SqliteBackend {
    fn put(&self, rec: &Record) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO objects(key, seq, revision, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET revision = excluded.revision, data = excluded.data",
            (&rec.key, rec.seq as i64, rec.revision as i64, maybe_compress(&rec.data)),
        )
        .with_context(|| format!("writing {}", rec.key))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM objects WHERE key = ?1", [key])
            .with_context(|| format!("deleting {}", key))?;
        counter!("persist_delete_total", 1u64);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Record>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT key, seq, revision, data FROM objects ORDER BY seq ASC")?;
        let mut rows = stmt.query([])?;
        let mut out: Vec<Record> = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let seq: i64 = row.get(1)?;
            let revision: i64 = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            out.push(Record { key, seq: seq as u64, revision: revision as u64, data: maybe_decompress(&blob) });
        }
        histogram!("persist_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".strata");
        let _ = std::fs::create_dir_all(&p);
        p.push("strata.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "strata.db".to_string()
}

pub fn maybe_compress(data: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("STRATA_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(data, lvl).unwrap_or_else(|_| data.to_vec());
    }
    #[allow(unreachable_code)]
    data.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: &str, seq: u64, revision: u64, data: &str) -> Record {
        Record { key: key.into(), seq, revision, data: data.as_bytes().to_vec() }
    }

    #[test]
    fn put_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.db");
        let db = SqliteBackend::open(path.to_str().unwrap()).unwrap();
        db.put(&rec("g/v1/K/a/two", 2, 5, r#"{"n":2}"#)).unwrap();
        db.put(&rec("g/v1/K/a/one", 1, 3, r#"{"n":1}"#)).unwrap();
        // Update keeps the original creation sequence.
        db.put(&rec("g/v1/K/a/one", 99, 7, r#"{"n":11}"#)).unwrap();

        let rows = db.load_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "g/v1/K/a/one");
        assert_eq!(rows[0].seq, 1);
        assert_eq!(rows[0].revision, 7);
        assert_eq!(rows[0].data, br#"{"n":11}"#.to_vec());

        db.delete("g/v1/K/a/two").unwrap();
        assert_eq!(db.load_all().unwrap().len(), 1);
    }

    #[test]
    fn reopen_sees_previous_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.db");
        {
            let db = SqliteBackend::open(path.to_str().unwrap()).unwrap();
            db.put(&rec("g/v1/K/a/one", 1, 1, "{}")).unwrap();
        }
        let db = SqliteBackend::open(path.to_str().unwrap()).unwrap();
        assert_eq!(db.load_all().unwrap(), vec![rec("g/v1/K/a/one", 1, 1, "{}")]);
    }
}

use super::{decode_record, encode_record, KeyPattern, PersistenceBackend, Row};
use crate::error::{CacheError, RecordCodecError};
use crate::error;
use crate::record::{CacheKey, Record};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::debug;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::thread;
use std::thread::JoinHandle;

const SELECT_CHUNK: usize = 500;

type Ack<T> = Sender<Result<T, CacheError>>;

enum SqliteCommand {
    CreateSchema(Ack<()>),
    Select(Vec<CacheKey>, Ack<Vec<Row>>),
    SelectAll(Ack<Vec<Row>>),
    Upsert(Vec<(CacheKey, String)>, Ack<()>),
    Delete(Vec<CacheKey>, Ack<usize>),
    DeleteMatching(String, Ack<usize>),
    Clear(bool, Ack<()>),
    Count(Ack<usize>),
    Shutdown(Sender<()>),
}

/// Records in one SQLite table, `records(_id, key UNIQUE, record)`.
///
/// The connection lives on a dedicated thread; calls are sent to it as commands and
/// block on a one-slot ack channel, so every statement runs on the same connection in
/// arrival order.
pub struct SqliteBackend {
    path: PathBuf,
    topic: Sender<SqliteCommand>,
    handle: Option<JoinHandle<()>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        let (topic, receiver): (Sender<SqliteCommand>, Receiver<SqliteCommand>) = unbounded();
        let name = path.display().to_string();
        let handle = thread::Builder::new()
            .name("normcache-sqlite".to_string())
            .spawn(move || run(conn, receiver, name))?;
        debug!("sqlite backend opened at {}", path.display());
        Ok(Self { path, topic, handle: Some(handle) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn call<T>(&self, command: impl FnOnce(Ack<T>) -> SqliteCommand) -> Result<T, CacheError> {
        let (ack, response) = bounded::<Result<T, CacheError>>(1);
        self.topic.send(command(ack))?;
        response.recv()?
    }

    /// Stops the connection thread and waits for it.
    pub fn shutdown(mut self) -> Result<(), CacheError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), CacheError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let (ack, stopped) = bounded::<()>(1);
        self.topic.send(SqliteCommand::Shutdown(ack))?;
        stopped.recv()?;
        handle.join().map_err(|_| CacheError::custom("sqlite connection thread join failed"))
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("sqlite backend {} did not shut down cleanly: {}", self.path.display(), e);
        }
    }
}

fn run(mut conn: Connection, receiver: Receiver<SqliteCommand>, name: String) {
    loop {
        let cmd = match receiver.recv() {
            Ok(c) => c,
            Err(e) => {
                error!("sqlite connection {} terminated: {}", name, e);
                break;
            }
        };
        match cmd {
            SqliteCommand::CreateSchema(ack) => {
                let _ = ack.send(create_schema(&conn));
            }
            SqliteCommand::Select(keys, ack) => {
                let _ = ack.send(select(&conn, &keys));
            }
            SqliteCommand::SelectAll(ack) => {
                let _ = ack.send(select_all(&conn));
            }
            SqliteCommand::Upsert(rows, ack) => {
                let _ = ack.send(upsert(&mut conn, rows));
            }
            SqliteCommand::Delete(keys, ack) => {
                let _ = ack.send(delete(&mut conn, &keys));
            }
            SqliteCommand::DeleteMatching(like, ack) => {
                let _ = ack.send(delete_matching(&conn, &like));
            }
            SqliteCommand::Clear(vacuum, ack) => {
                let _ = ack.send(clear(&conn, vacuum));
            }
            SqliteCommand::Count(ack) => {
                let _ = ack.send(count(&conn));
            }
            SqliteCommand::Shutdown(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!("sqlite connection {} closed", name);
}

fn create_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL UNIQUE,
            record TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS cache_key_index ON records (key);
        "#,
    )?;
    Ok(())
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let key = CacheKey::new(row.get::<_, String>(0)?);
    let decoded = match row.get_ref(1)? {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => decode_record(&key, bytes),
        other => Err(RecordCodecError::InvalidRecordEncoding {
            key: key.clone(),
            reason: format!("stored as {}", other.data_type()),
        }),
    };
    Ok((key, decoded))
}

fn select(conn: &Connection, keys: &[CacheKey]) -> Result<Vec<Row>, CacheError> {
    let mut out = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(SELECT_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let mut stmt = conn.prepare(&format!("SELECT key, record FROM records WHERE key IN ({placeholders})"))?;
        let rows = stmt.query_map(params_from_iter(chunk.iter().map(CacheKey::as_str)), read_row)?;
        for row in rows {
            out.push(row?);
        }
    }
    debug!("sqlite select {} keys -> {} rows", keys.len(), out.len());
    Ok(out)
}

fn select_all(conn: &Connection) -> Result<Vec<Row>, CacheError> {
    let mut stmt = conn.prepare("SELECT key, record FROM records ORDER BY _id")?;
    let rows = stmt.query_map([], read_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn upsert(conn: &mut Connection, rows: Vec<(CacheKey, String)>) -> Result<(), CacheError> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO records (key, record) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET record = excluded.record",
        )?;
        for (key, record) in &rows {
            stmt.execute(params![key.as_str(), record])?;
        }
    }
    tx.commit()?;
    debug!("sqlite upserted {} records", rows.len());
    Ok(())
}

fn delete(conn: &mut Connection, keys: &[CacheKey]) -> Result<usize, CacheError> {
    let tx = conn.transaction()?;
    let mut deleted = 0;
    {
        let mut stmt = tx.prepare_cached("DELETE FROM records WHERE key = ?1")?;
        for key in keys {
            deleted += stmt.execute(params![key.as_str()])?;
        }
    }
    tx.commit()?;
    Ok(deleted)
}

fn delete_matching(conn: &Connection, like: &str) -> Result<usize, CacheError> {
    Ok(conn.execute(r"DELETE FROM records WHERE key LIKE ?1 ESCAPE '\'", params![like])?)
}

fn clear(conn: &Connection, vacuum: bool) -> Result<(), CacheError> {
    conn.execute("DELETE FROM records", [])?;
    if vacuum {
        conn.execute_batch("VACUUM;")?;
    }
    Ok(())
}

fn count(conn: &Connection) -> Result<usize, CacheError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
    Ok(n as usize)
}

impl PersistenceBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn create_schema_if_needed(&mut self) -> Result<(), CacheError> {
        self.call(SqliteCommand::CreateSchema)
    }

    fn select(&self, keys: &[CacheKey]) -> Result<Vec<Row>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = keys.to_vec();
        self.call(|ack| SqliteCommand::Select(keys, ack))
    }

    fn select_all(&self) -> Result<Vec<Row>, CacheError> {
        self.call(SqliteCommand::SelectAll)
    }

    fn upsert(&mut self, records: Vec<Record>) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records
            .iter()
            .map(|record| Ok((record.key().clone(), encode_record(record)?)))
            .collect::<Result<Vec<_>, CacheError>>()?;
        self.call(|ack| SqliteCommand::Upsert(rows, ack))
    }

    fn delete(&mut self, key: &CacheKey) -> Result<bool, CacheError> {
        let keys = vec![key.clone()];
        Ok(self.call(|ack| SqliteCommand::Delete(keys, ack))? > 0)
    }

    fn delete_many(&mut self, keys: &[CacheKey]) -> Result<usize, CacheError> {
        let keys = keys.to_vec();
        self.call(|ack| SqliteCommand::Delete(keys, ack))
    }

    fn delete_matching(&mut self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let like = pattern.to_sql_like();
        self.call(|ack| SqliteCommand::DeleteMatching(like, ack))
    }

    fn clear(&mut self, vacuum: bool) -> Result<(), CacheError> {
        self.call(|ack| SqliteCommand::Clear(vacuum, ack))
    }

    fn record_count(&self) -> Result<usize, CacheError> {
        self.call(SqliteCommand::Count)
    }
}

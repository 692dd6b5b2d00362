//! Hand-rolled `rusqlite` connection pool.
//!
//! The teacher keeps a single `Arc<Mutex<Connection>>` per store (see
//! `vault::vault_db::VaultDb`, `signals::db_storage::DbSignalStorage`).
//! This generalizes that idiom to a free-list of N connections gated by a
//! semaphore rather than a single shared lock, sized to cover the poll
//! workers, the scheduler, and feed-reader headroom. WAL mode makes
//! concurrent readers/writers across those N connections safe.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

const SCHEMA_SQL: &str = include_str!("schema.sql");

struct Inner {
    free: Mutex<Vec<Connection>>,
    sem: Semaphore,
    path: String,
}

#[derive(Clone)]
pub struct DbPool {
    inner: Arc<Inner>,
}

/// A checked-out connection. Returned to the pool's free-list on drop.
pub struct PooledConn {
    conn: Option<Connection>,
    inner: Arc<Inner>,
}

impl std::ops::Deref for PooledConn {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.free.lock().push(conn);
        }
        self.inner.sem.add_permits(1);
    }
}

impl DbPool {
    /// Opens `size` connections against `path`, applying the schema once.
    pub fn open(path: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let mut conns = Vec::with_capacity(size);

        for i in 0..size {
            let conn = Connection::open(path)
                .with_context(|| format!("opening db connection {i} at {path}"))?;
            conn.pragma_update(None, "journal_mode", "WAL").ok();
            conn.pragma_update(None, "synchronous", "NORMAL").ok();
            conn.pragma_update(None, "foreign_keys", "ON").ok();
            if i == 0 {
                conn.execute_batch(SCHEMA_SQL)
                    .context("applying pipeline schema")?;
            }
            conns.push(conn);
        }

        info!(path, size, "db pool opened");

        Ok(Self {
            inner: Arc::new(Inner {
                free: Mutex::new(conns),
                sem: Semaphore::new(size),
                path: path.to_string(),
            }),
        })
    }

    /// Opens an in-memory pool of size 1, for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory db")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying pipeline schema")?;
        Ok(Self {
            inner: Arc::new(Inner {
                free: Mutex::new(vec![conn]),
                sem: Semaphore::new(1),
                path: ":memory:".to_string(),
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Checks out a connection, waiting if the pool is saturated.
    pub async fn checkout(&self) -> Result<PooledConn> {
        let permit = self
            .inner
            .sem
            .acquire()
            .await
            .context("db pool semaphore closed")?;
        permit.forget();

        let conn = self
            .inner
            .free
            .lock()
            .pop()
            .expect("semaphore accounting guarantees a free connection");

        Ok(PooledConn {
            conn: Some(conn),
            inner: self.inner.clone(),
        })
    }
}

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};

use super::fsm::SwapStateMachine;
use super::unix_now;

/// Durable home of swap state machines. `put` must be durable when it returns.
pub trait SwapStore: Send + Sync {
    fn put(&self, swap: &SwapStateMachine) -> Result<()>;

    fn get(&self, swap_id: &str) -> Result<Option<SwapStateMachine>>;

    fn list_all(&self) -> Result<Vec<SwapStateMachine>>;
}

#[derive(Debug)]
pub struct SqliteSwapStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteSwapStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        migrate(&conn).context("migrate sqlite schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SwapStore for SqliteSwapStore {
    fn put(&self, swap: &SwapStateMachine) -> Result<()> {
        let body =
            serde_json::to_string(swap).with_context(|| format!("encode swap {}", swap.id))?;
        let conn = self.conn.lock().expect("swap store mutex poisoned");
        conn.execute(
            r#"
INSERT INTO swaps (
  swap_id,
  swap_type,
  role,
  channel_id,
  current_state,
  body,
  updated_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7
)
ON CONFLICT(swap_id) DO UPDATE SET
  current_state = excluded.current_state,
  body = excluded.body,
  updated_at = excluded.updated_at
"#,
            params![
                &swap.id,
                swap.swap_type.to_string(),
                swap.role.to_string(),
                &swap.data.channel_id,
                swap.current.to_string(),
                body,
                i64::try_from(unix_now()).unwrap_or(i64::MAX),
            ],
        )
        .with_context(|| format!("put swap {}", swap.id))?;
        Ok(())
    }

    fn get(&self, swap_id: &str) -> Result<Option<SwapStateMachine>> {
        let conn = self.conn.lock().expect("swap store mutex poisoned");
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM swaps WHERE swap_id = ?1",
                params![swap_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get swap {swap_id}"))?;

        body.map(|body| {
            serde_json::from_str(&body).with_context(|| format!("decode swap {swap_id}"))
        })
        .transpose()
    }

    fn list_all(&self) -> Result<Vec<SwapStateMachine>> {
        let conn = self.conn.lock().expect("swap store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT swap_id, body FROM swaps ORDER BY swap_id")
            .context("prepare list swaps")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("query list swaps")?;

        let mut out = Vec::new();
        for row in rows {
            let (swap_id, body) = row.context("read swap row")?;
            out.push(
                serde_json::from_str(&body).with_context(|| format!("decode swap {swap_id}"))?,
            );
        }
        Ok(out)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  swap_id TEXT PRIMARY KEY,
  swap_type TEXT NOT NULL,
  role TEXT NOT NULL,
  channel_id TEXT NOT NULL,
  current_state TEXT NOT NULL,
  body TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_channel_idx ON swaps(channel_id);
"#,
    )
    .context("create tables")?;
    Ok(())
}

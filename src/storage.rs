use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::card::Card;
use crate::queue::CardCache;

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    max_cards: usize,
    ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
    /// Cards kept after pruning, newest first. Zero keeps everything.
    pub max_cards: usize,
    /// Age after which a cached card is dropped. Zero never expires.
    pub ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            path: None,
            max_cards: 200,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_cards: opts.max_cards,
            ttl: opts.ttl,
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn card_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0))
            .context("storage: count cards")?;
        Ok(count.max(0) as usize)
    }

    fn is_expired(&self, stored_at: i64, now: DateTime<Utc>) -> bool {
        !self.ttl.is_zero() && stored_at < cutoff(now, self.ttl)
    }

    pub(crate) fn load_at(&self, now: DateTime<Utc>) -> Result<Vec<Card>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, payload, stored_at FROM cards ORDER BY seq ASC")
            .context("storage: prepare card load")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("storage: query cards")?;

        let mut cards = Vec::new();
        let mut skipped = 0usize;
        for row in rows {
            let Ok((id, payload, stored_at)) = row else {
                skipped += 1;
                continue;
            };
            if self.is_expired(stored_at, now) {
                skipped += 1;
                continue;
            }
            match serde_json::from_str::<Card>(&payload) {
                Ok(card) if card.id == id => cards.push(card),
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, "skipped unusable cached cards");
        }
        Ok(cards)
    }

    pub(crate) fn persist_at(&self, cards: &[Card], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("storage: begin card write")?;
        {
            let mut upsert = tx
                .prepare(
                    r#"
INSERT INTO cards (id, payload, stored_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET
  payload = excluded.payload,
  stored_at = excluded.stored_at
"#,
                )
                .context("storage: prepare card upsert")?;
            for card in cards {
                let payload = serde_json::to_string(card).context("storage: encode card")?;
                upsert
                    .execute(params![card.id, payload, now.timestamp()])
                    .context("storage: upsert card")?;
            }
        }

        let mut pruned = 0usize;
        if !self.ttl.is_zero() {
            pruned += tx
                .execute(
                    "DELETE FROM cards WHERE stored_at < ?1",
                    params![cutoff(now, self.ttl)],
                )
                .context("storage: prune expired cards")?;
        }
        if self.max_cards > 0 {
            pruned += tx
                .execute(
                    "DELETE FROM cards WHERE seq NOT IN (SELECT seq FROM cards ORDER BY seq DESC LIMIT ?1)",
                    params![self.max_cards as i64],
                )
                .context("storage: prune oldest cards")?;
        }
        tx.commit().context("storage: commit card write")?;

        if pruned > 0 {
            info!(pruned, "card cache pruned");
        }
        Ok(())
    }
}

impl CardCache for Store {
    fn load(&self) -> Result<Vec<Card>> {
        self.load_at(Utc::now())
    }

    fn persist(&self, cards: &[Card]) -> Result<()> {
        self.persist_at(cards, Utc::now())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cards", [])
            .context("storage: clear cards")?;
        Ok(())
    }
}

fn cutoff(now: DateTime<Utc>, ttl: Duration) -> i64 {
    now.timestamp()
        .saturating_sub(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {version}"))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS cards (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  payload TEXT NOT NULL,
  stored_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cards_stored_at ON cards(stored_at);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("wikifeed").join("cards.db"))
}

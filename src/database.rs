//! SQLite storage: per-session chat history, the retrieval corpus
//! (passages + FTS5 mirror), and a small key/value state table used by the
//! scheduler. One connection behind a mutex; methods are synchronous and
//! cheap enough to call from async code directly.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;

use crate::llm::ChatTurn;

/// A unit of retrievable text: either a reference dialogue excerpt tagged
/// with the roles that appear in it, or untagged background material.
#[derive(Debug, Clone, Deserialize)]
pub struct Passage {
    pub content: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_passage_kind")]
    pub kind: String,
}

fn default_passage_kind() -> String {
    "dialogue".to_string()
}

pub struct ChatDatabase {
    conn: Mutex<Connection>,
}

impl ChatDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_history_session
                ON chat_history(session_id, id);

            CREATE TABLE IF NOT EXISTS passages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                roles TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'dialogue'
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS passages_fts USING fts5(
                content,
                content='passages',
                content_rowid='id'
            );

            CREATE TABLE IF NOT EXISTS app_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ─── Chat history ─────────────────────────────────────────────────────

    pub fn append_turns(&self, session_id: &str, turns: &[ChatTurn]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for turn in turns {
            tx.execute(
                "INSERT INTO chat_history (session_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, turn.role, turn.content, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The last `limit` turns for a session, oldest first.
    pub fn recent_history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, content FROM (
                SELECT id, role, content FROM chat_history
                WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
            ) ORDER BY id ASC",
        )?;
        let turns = stmt
            .query_map(params![session_id, limit as i64], |row| {
                Ok(ChatTurn {
                    role: row.get(0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    pub fn history_len(&self, session_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_history WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ─── Retrieval corpus ─────────────────────────────────────────────────

    pub fn insert_passage(&self, passage: &Passage) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO passages (content, roles, kind) VALUES (?1, ?2, ?3)",
            params![passage.content, passage.roles.join(","), passage.kind],
        )?;
        // Keep the FTS index in sync with the content table.
        conn.execute(
            "INSERT INTO passages_fts (rowid, content)
             VALUES (last_insert_rowid(), ?1)",
            params![passage.content],
        )?;
        Ok(())
    }

    pub fn passage_count(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM passages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Full-text search scoped the way the role-play prompt needs it:
    /// dialogue passages featuring the given role, plus any background
    /// material.
    pub fn search_passages(&self, query: &str, role: &str, limit: usize) -> Result<Vec<String>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.content
             FROM passages_fts
             JOIN passages p ON p.id = passages_fts.rowid
             WHERE passages_fts MATCH ?1
               AND (instr(p.roles, ?2) > 0 OR p.kind = 'background')
             ORDER BY rank
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![match_expr, role, limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Seed the corpus from a JSON array of passages. Only runs against an
    /// empty corpus so restarts don't duplicate rows.
    pub fn seed_passages_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        if self.passage_count()? > 0 {
            return Ok(0);
        }
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {:?}", path.as_ref()))?;
        let passages: Vec<Passage> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {:?}", path.as_ref()))?;
        for passage in &passages {
            self.insert_passage(passage)?;
        }
        tracing::info!("Seeded {} passages from {:?}", passages.len(), path.as_ref());
        Ok(passages.len())
    }

    // ─── App state ────────────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT value FROM app_state WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(value) => Ok(Some(value?)),
            None => Ok(None),
        }
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Turn free text into an FTS5 MATCH expression: quoted tokens OR'd
/// together, so punctuation and role-name colons never reach the parser.
fn fts_match_expr(query: &str) -> String {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    tokens.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("reverie_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    #[test]
    fn history_window_returns_most_recent_turns_in_order() {
        let path = temp_db_path("history_window");
        let db = ChatDatabase::new(&path).expect("db init");

        for i in 0..10 {
            db.append_turns(
                "s1",
                &[
                    ChatTurn::user(format!("q{}", i)),
                    ChatTurn::assistant(format!("a{}", i)),
                ],
            )
            .expect("append");
        }

        assert_eq!(db.history_len("s1").unwrap(), 20);
        let recent = db.recent_history("s1", 4).unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].content, "q8");
        assert_eq!(recent[3].content, "a9");

        // Other sessions are untouched.
        assert_eq!(db.history_len("s2").unwrap(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn passage_search_filters_by_role_or_background() {
        let path = temp_db_path("passage_search");
        let db = ChatDatabase::new(&path).expect("db init");

        db.insert_passage(&Passage {
            content: "Dean laughs about the bowling match".to_string(),
            roles: vec!["Dean".to_string(), "Sal".to_string()],
            kind: "dialogue".to_string(),
        })
        .unwrap();
        db.insert_passage(&Passage {
            content: "Tyson grumbles about the bowling match".to_string(),
            roles: vec!["Tyson".to_string()],
            kind: "dialogue".to_string(),
        })
        .unwrap();
        db.insert_passage(&Passage {
            content: "The bowling alley sits at the edge of town".to_string(),
            roles: vec![],
            kind: "background".to_string(),
        })
        .unwrap();

        let hits = db.search_passages("bowling", "Dean", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| h.contains("Dean laughs")));
        assert!(hits.iter().any(|h| h.contains("bowling alley")));
        assert!(!hits.iter().any(|h| h.contains("Tyson")));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn punctuation_heavy_query_does_not_break_fts() {
        let path = temp_db_path("fts_sanitize");
        let db = ChatDatabase::new(&path).expect("db init");

        db.insert_passage(&Passage {
            content: "Dean waves hello".to_string(),
            roles: vec!["Dean".to_string()],
            kind: "dialogue".to_string(),
        })
        .unwrap();

        let hits = db
            .search_passages("Dean: (waves) \"hello!\"", "Dean", 10)
            .unwrap();
        assert!(!hits.is_empty());

        assert!(db.search_passages("?!», --", "Dean", 10).unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn app_state_round_trip() {
        let path = temp_db_path("app_state");
        let db = ChatDatabase::new(&path).expect("db init");

        assert_eq!(db.get_state("news_last_run").unwrap(), None);
        db.set_state("news_last_run", "2026-08-06").unwrap();
        assert_eq!(
            db.get_state("news_last_run").unwrap().as_deref(),
            Some("2026-08-06")
        );
        db.set_state("news_last_run", "2026-08-07").unwrap();
        assert_eq!(
            db.get_state("news_last_run").unwrap().as_deref(),
            Some("2026-08-07")
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn seeding_skips_non_empty_corpus() {
        let path = temp_db_path("seed");
        let db = ChatDatabase::new(&path).expect("db init");

        let dir = tempfile::tempdir().unwrap();
        let seed_path = dir.path().join("passages.json");
        std::fs::write(
            &seed_path,
            r#"[{"content": "Dean hums a tune", "roles": ["Dean"]},
                {"content": "The mill by the river", "kind": "background"}]"#,
        )
        .unwrap();

        assert_eq!(db.seed_passages_from_file(&seed_path).unwrap(), 2);
        assert_eq!(db.passage_count().unwrap(), 2);
        // Second run is a no-op.
        assert_eq!(db.seed_passages_from_file(&seed_path).unwrap(), 0);
        assert_eq!(db.passage_count().unwrap(), 2);

        let _ = std::fs::remove_file(&path);
    }
}

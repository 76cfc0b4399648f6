//! Passage retrieval for role-play prompts.
//!
//! The retriever is scoped to one persona at construction time: it returns
//! dialogue excerpts featuring that persona plus general background
//! material, ranked by full-text relevance.

use std::sync::Arc;

use anyhow::Result;

use crate::database::ChatDatabase;

pub const RETRIEVAL_TOP_K: usize = 15;

pub trait PassageRetriever: Send + Sync {
    fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<String>>;
}

pub struct SqlitePassageRetriever {
    db: Arc<ChatDatabase>,
    bot_role: String,
}

impl SqlitePassageRetriever {
    pub fn new(db: Arc<ChatDatabase>, bot_role: impl Into<String>) -> Self {
        Self {
            db,
            bot_role: bot_role.into(),
        }
    }
}

impl PassageRetriever for SqlitePassageRetriever {
    fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        self.db.search_passages(query, &self.bot_role, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Passage;

    #[test]
    fn retriever_is_scoped_to_its_persona() {
        let mut path = std::env::temp_dir();
        path.push(format!("reverie_retriever_{}.db", uuid::Uuid::new_v4()));
        let db = Arc::new(ChatDatabase::new(&path).expect("db init"));

        db.insert_passage(&Passage {
            content: "Dean tends the greenhouse".to_string(),
            roles: vec!["Dean".to_string()],
            kind: "dialogue".to_string(),
        })
        .unwrap();
        db.insert_passage(&Passage {
            content: "Sal avoids the greenhouse".to_string(),
            roles: vec!["Sal".to_string()],
            kind: "dialogue".to_string(),
        })
        .unwrap();

        let retriever = SqlitePassageRetriever::new(db, "Dean");
        let hits = retriever.retrieve("greenhouse", RETRIEVAL_TOP_K).unwrap();
        assert_eq!(hits, vec!["Dean tends the greenhouse".to_string()]);

        let _ = std::fs::remove_file(&path);
    }
}

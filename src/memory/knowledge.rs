//! 知识库与状态存储
//!
//! KnowledgeStore 提供两个命名空间：
//! - knowledge：字符串键值（自评结果等），INSERT OR REPLACE 语义
//! - agent_state：单条记录（id = 1），整份 AgentState 以 JSON 保存
//!
//! SqliteKnowledgeStore 是默认实现（同步 rusqlite，连接放在 Mutex 中）；InMemoryKnowledgeStore 用于测试。
//! 所有方法失败时只记录日志并返回 false / None，不向编排循环抛错。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::state::AgentState;
use crate::core::AgentError;

/// 知识与状态存储协作者
pub trait KnowledgeStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> bool;
    fn delete(&self, key: &str) -> bool;
    /// 以 prefix 开头的键（排序）
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
    fn save_state(&self, state: &AgentState) -> bool;
    fn load_state(&self) -> Option<AgentState>;
}

/// SQLite 知识库
pub struct SqliteKnowledgeStore {
    conn: Mutex<Connection>,
}

impl SqliteKnowledgeStore {
    /// 打开（或创建）数据库文件并初始化表结构；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Persistence(format!("Create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        tracing::info!(path = %path.display(), "Knowledge base initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), AgentError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS knowledge (
                key TEXT PRIMARY KEY,
                value TEXT,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_state (
                id INTEGER PRIMARY KEY,
                state_data TEXT,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(())
    }

    fn with_conn<T>(&self, op: &str, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Option<T> {
        let conn = match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        match f(&conn) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(op = op, error = %e, "knowledge base error");
                None
            }
        }
    }
}

impl KnowledgeStore for SqliteKnowledgeStore {
    fn get(&self, key: &str) -> Option<String> {
        self.with_conn("get", |c| {
            c.query_row(
                "SELECT value FROM knowledge WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
        })
        .flatten()
        .flatten()
    }

    fn put(&self, key: &str, value: &str) -> bool {
        let ok = self
            .with_conn("put", |c| {
                c.execute(
                    "INSERT OR REPLACE INTO knowledge (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )
            })
            .is_some();
        if ok {
            tracing::debug!(key = %key, "Stored knowledge");
        }
        ok
    }

    fn delete(&self, key: &str) -> bool {
        self.with_conn("delete", |c| {
            c.execute("DELETE FROM knowledge WHERE key = ?1", params![key])
        })
        .is_some()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.with_conn("keys", |c| {
            let mut stmt = c.prepare("SELECT key FROM knowledge WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        })
        .unwrap_or_default()
    }

    fn save_state(&self, state: &AgentState) -> bool {
        let json = match serde_json::to_string(state) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Serialize agent state failed");
                return false;
            }
        };
        self.with_conn("save_state", |c| {
            c.execute(
                "INSERT OR REPLACE INTO agent_state (id, state_data) VALUES (1, ?1)",
                params![json],
            )
        })
        .is_some()
    }

    fn load_state(&self) -> Option<AgentState> {
        let json = self
            .with_conn("load_state", |c| {
                c.query_row(
                    "SELECT state_data FROM agent_state WHERE id = 1",
                    [],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()
            })
            .flatten()
            .flatten()?;
        match serde_json::from_str(&json) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "Stored agent state is unreadable, ignoring it");
                None
            }
        }
    }
}

/// 内存知识库（测试 / 无持久化场景）
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    entries: Mutex<BTreeMap<String, String>>,
    state: Mutex<Option<AgentState>>,
    saves: Mutex<usize>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// save_state 被调用的次数
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or_default()
    }
}

impl KnowledgeStore for InMemoryKnowledgeStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> bool {
        match self.entries.lock() {
            Ok(mut m) => {
                m.insert(key.to_string(), value.to_string());
                true
            }
            Err(_) => false,
        }
    }

    fn delete(&self, key: &str) -> bool {
        match self.entries.lock() {
            Ok(mut m) => {
                m.remove(key);
                true
            }
            Err(_) => false,
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .map(|m| m.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default()
    }

    fn save_state(&self, state: &AgentState) -> bool {
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        match self.state.lock() {
            Ok(mut s) => {
                *s = Some(state.clone());
                true
            }
            Err(_) => false,
        }
    }

    fn load_state(&self) -> Option<AgentState> {
        self.state.lock().ok()?.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::AgentStatus;

    fn exercise(store: &dyn KnowledgeStore) {
        assert!(store.get("color").is_none());
        assert!(store.put("color", "blue"));
        assert!(store.put("color", "green"));
        assert_eq!(store.get("color").as_deref(), Some("green"));
        assert!(store.put("self_evaluation_1", "{}"));
        assert!(store.put("self_evaluation_2", "{}"));
        assert_eq!(
            store.keys_with_prefix("self_evaluation_"),
            vec!["self_evaluation_1".to_string(), "self_evaluation_2".to_string()]
        );
        assert!(store.delete("color"));
        assert!(store.get("color").is_none());

        assert!(store.load_state().is_none());
        let mut state = AgentState::default();
        state.begin_run("persist me");
        state.status = AgentStatus::Completed;
        assert!(store.save_state(&state));
        assert_eq!(store.load_state(), Some(state));
    }

    #[test]
    fn test_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKnowledgeStore::open(dir.path().join("data/kb.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_sqlite_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.db");
        {
            let store = SqliteKnowledgeStore::open(&path).unwrap();
            let mut state = AgentState::default();
            state.current_task = "remember".to_string();
            assert!(store.save_state(&state));
        }
        let reopened = SqliteKnowledgeStore::open(&path).unwrap();
        assert_eq!(reopened.load_state().unwrap().current_task, "remember");
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryKnowledgeStore::new();
        exercise(&store);
        assert_eq!(store.save_count(), 1);
    }
}

//! Cross-platform message correspondence store.
//!
//! One SQLite database per hub, file named `<hub_name>.db`, holding a
//! single `messages` table with one nullable column per connected platform.
//! A row represents one logical message; the column for a platform holds
//! that platform's native id for the mirror of this message, or is null if
//! no mirror exists (yet, or ever).

use std::sync::Mutex;

use anyhow::Context;
use rusqlite::{params_from_iter, Connection};

/// SQLite-backed correspondence table for a single hub.
pub struct Store {
    conn: Mutex<Connection>,
    platforms: Vec<&'static str>,
}

impl Store {
    /// Open (or create) `<hub_name>.db` in the current working directory.
    /// `platforms` is the fixed, compiled-in set of connector names
    /// participating in this hub. When `keep_data` is false the `messages`
    /// table is dropped and recreated; otherwise existing rows survive.
    pub fn open(hub_name: &str, platforms: &[&'static str], keep_data: bool) -> anyhow::Result<Self> {
        let db_path = std::path::Path::new(".").join(format!("{hub_name}.db"));
        Self::open_path(&db_path, platforms, keep_data)
    }

    /// Open a database at an explicit path (used by tests).
    pub fn open_path(
        db_path: &std::path::Path,
        platforms: &[&'static str],
        keep_data: bool,
    ) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        if !keep_data {
            conn.execute_batch(r#"DROP TABLE IF EXISTS "messages";"#)?;
        }

        let columns = platforms
            .iter()
            .map(|p| format!(r#""{p}" VARCHAR(255)"#))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "messages" ({columns});"#
        ))?;

        Ok(Self {
            conn: Mutex::new(conn),
            platforms: platforms.to_vec(),
        })
    }

    /// Insert a new row recording the origin id for a freshly observed
    /// message. All sibling columns start null.
    pub fn insert_origin(&self, origin_platform: &str, origin_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("correspondence store poisoned");
        let cols = self
            .platforms
            .iter()
            .map(|p| format!(r#""{p}""#))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = self
            .platforms
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let values: Vec<Option<String>> = self
            .platforms
            .iter()
            .map(|p| {
                if *p == origin_platform {
                    Some(origin_id.to_string())
                } else {
                    None
                }
            })
            .collect();

        conn.execute(
            &format!(r#"INSERT INTO "messages" ({cols}) VALUES ({placeholders})"#),
            params_from_iter(values),
        )?;
        Ok(())
    }

    /// Update the row where `origin_platform = origin_id`, setting
    /// `sibling_platform` to `sibling_id`. If no row matches, the update is
    /// a no-op (the caller logs a warning). If more than one row matches
    /// (an invariant violation — see the Open Question resolution in
    /// DESIGN.md), every matching row is updated.
    pub fn set_sibling(
        &self,
        origin_platform: &str,
        origin_id: &str,
        sibling_platform: &str,
        sibling_id: &str,
    ) -> anyhow::Result<usize> {
        let conn = self.conn.lock().expect("correspondence store poisoned");
        let affected = conn.execute(
            &format!(
                r#"UPDATE "messages" SET "{sibling_platform}" = ?1 WHERE "{origin_platform}" = ?2"#
            ),
            rusqlite::params![sibling_id, origin_id],
        )?;
        Ok(affected)
    }

    /// Look up the row where `lookup_platform = lookup_id` and return it as
    /// a `platform -> id` mapping (missing columns are `None`). Returns
    /// `None` if no row matches.
    pub fn find_row(
        &self,
        lookup_platform: &str,
        lookup_id: &str,
    ) -> anyhow::Result<Option<Vec<(String, Option<String>)>>> {
        let conn = self.conn.lock().expect("correspondence store poisoned");
        let cols = self
            .platforms
            .iter()
            .map(|p| format!(r#""{p}""#))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {cols} FROM "messages" WHERE "{lookup_platform}" = ?1 LIMIT 1"#
        ))?;
        let mut rows = stmt.query(rusqlite::params![lookup_id])?;
        if let Some(row) = rows.next()? {
            let mut result = Vec::with_capacity(self.platforms.len());
            for (i, platform) in self.platforms.iter().enumerate() {
                let id: Option<String> = row.get(i)?;
                result.push((platform.to_string(), id));
            }
            Ok(Some(result))
        } else {
            Ok(None)
        }
    }

    /// Translate a known id on `from_platform` to the corresponding id on
    /// `to_platform`, if a row exists and that sibling column is filled in.
    pub fn translate(
        &self,
        from_platform: &str,
        id: &str,
        to_platform: &str,
    ) -> anyhow::Result<Option<String>> {
        let row = self.find_row(from_platform, id)?;
        Ok(row.and_then(|cols| {
            cols.into_iter()
                .find(|(p, _)| p == to_platform)
                .and_then(|(_, v)| v)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLATFORMS: &[&str] = &["discord", "slack", "cqhttp"];

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("hub.db");
        let store = Store::open_path(&db_path, PLATFORMS, true).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_origin_creates_row_with_only_origin_set() {
        let (_dir, store) = temp_store();
        store.insert_origin("discord", "a1").unwrap();
        let row = store.find_row("discord", "a1").unwrap().unwrap();
        let map: std::collections::HashMap<_, _> = row.into_iter().collect();
        assert_eq!(map["discord"], Some("a1".to_string()));
        assert_eq!(map["slack"], None);
        assert_eq!(map["cqhttp"], None);
    }

    #[test]
    fn set_sibling_fills_in_mirror_id() {
        let (_dir, store) = temp_store();
        store.insert_origin("discord", "a1").unwrap();
        let affected = store.set_sibling("discord", "a1", "slack", "b1").unwrap();
        assert_eq!(affected, 1);
        assert_eq!(
            store.translate("discord", "a1", "slack").unwrap(),
            Some("b1".to_string())
        );
    }

    #[test]
    fn set_sibling_with_no_matching_row_is_a_noop() {
        let (_dir, store) = temp_store();
        let affected = store
            .set_sibling("discord", "does-not-exist", "slack", "b1")
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn translate_miss_returns_none() {
        let (_dir, store) = temp_store();
        store.insert_origin("discord", "a1").unwrap();
        assert_eq!(store.translate("discord", "a1", "slack").unwrap(), None);
        assert_eq!(store.translate("discord", "unknown", "slack").unwrap(), None);
    }

    #[test]
    fn find_row_miss_returns_none() {
        let (_dir, store) = temp_store();
        assert!(store.find_row("discord", "nope").unwrap().is_none());
    }

    #[test]
    fn drop_table_when_keep_data_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("hub.db");
        {
            let store = Store::open_path(&db_path, PLATFORMS, true).unwrap();
            store.insert_origin("discord", "a1").unwrap();
        }
        let store = Store::open_path(&db_path, PLATFORMS, false).unwrap();
        assert!(store.find_row("discord", "a1").unwrap().is_none());
    }

    #[test]
    fn keep_data_preserves_existing_rows_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("hub.db");
        {
            let store = Store::open_path(&db_path, PLATFORMS, true).unwrap();
            store.insert_origin("discord", "a1").unwrap();
        }
        let store = Store::open_path(&db_path, PLATFORMS, true).unwrap();
        assert!(store.find_row("discord", "a1").unwrap().is_some());
    }

    #[test]
    fn reply_translation_degrades_gracefully_when_sibling_missing() {
        // S3 scenario: replying to a message whose row was never inserted.
        let (_dir, store) = temp_store();
        let translated = store.translate("discord", "a0", "slack").unwrap();
        assert_eq!(translated, None);
    }
}

use super::{now_ts, Store};
use crate::integrations::wunderlist::{TaskEvent, TaskOperation, WunderlistList, WunderlistTask};
use anyhow::{Context, Result};
use rusqlite::params;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub id: i64,
    pub list_id: i64,
    pub title: String,
    pub completed: bool,
    pub due_date: Option<String>,
}

impl Store {
    /// Returns false when the list already belongs to another client.
    pub fn upsert_wunderlist_list(&self, client_id: i64, list: &WunderlistList) -> Result<bool> {
        let n = self
            .lock_conn()
            .execute(
                "INSERT INTO wunderlist_lists (id, client_id, title) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title
                 WHERE wunderlist_lists.client_id = excluded.client_id",
                params![list.id, client_id, list.title],
            )
            .context("Failed to store Wunderlist list")?;
        Ok(n > 0)
    }

    pub fn mark_wunderlist_webhook(&self, client_id: i64, list_id: i64) -> Result<()> {
        self.lock_conn()
            .execute(
                "UPDATE wunderlist_lists SET webhook_registered = 1 WHERE id = ?1 AND client_id = ?2",
                params![list_id, client_id],
            )
            .context("Failed to mark Wunderlist webhook")?;
        Ok(())
    }

    /// Keyed by the vendor task id, so a repeated create is an update. A task
    /// owned by another client is left alone and false is returned.
    pub fn upsert_wunderlist_item(&self, client_id: i64, task: &WunderlistTask) -> Result<bool> {
        let n = self
            .lock_conn()
            .execute(
                "INSERT INTO wunderlist_items (id, list_id, client_id, title, completed, due_date, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    list_id = excluded.list_id,
                    title = excluded.title,
                    completed = excluded.completed,
                    due_date = excluded.due_date,
                    updated_at = excluded.updated_at
                 WHERE wunderlist_items.client_id = excluded.client_id",
                params![
                    task.id,
                    task.list_id,
                    client_id,
                    task.title,
                    task.completed,
                    task.due_date,
                    now_ts()
                ],
            )
            .context("Failed to store Wunderlist item")?;
        Ok(n > 0)
    }

    pub fn delete_wunderlist_item(&self, client_id: i64, item_id: i64) -> Result<bool> {
        let n = self
            .lock_conn()
            .execute(
                "DELETE FROM wunderlist_items WHERE id = ?1 AND client_id = ?2",
                params![item_id, client_id],
            )
            .context("Failed to delete Wunderlist item")?;
        Ok(n > 0)
    }

    /// Returns whether a row of `client_id` changed.
    pub fn apply_task_event(&self, client_id: i64, event: &TaskEvent) -> Result<bool> {
        match event.operation {
            TaskOperation::Create | TaskOperation::Update => {
                self.upsert_wunderlist_item(client_id, &event.task)
            }
            TaskOperation::Delete => self.delete_wunderlist_item(client_id, event.task.id),
        }
    }

    pub fn wunderlist_items(&self, client_id: i64) -> Result<Vec<StoredItem>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, list_id, title, completed, due_date FROM wunderlist_items
             WHERE client_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![client_id], |row| {
                Ok(StoredItem {
                    id: row.get(0)?,
                    list_id: row.get(1)?,
                    title: row.get(2)?,
                    completed: row.get(3)?,
                    due_date: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list Wunderlist items")?;
        Ok(rows)
    }
}

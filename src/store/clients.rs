use super::{now_ts, Store};
use crate::channels::Platform;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

/// One platform identity of a person. Rows of the same person share `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: i64,
    pub platform: Platform,
    pub handle: String,
    pub name: Option<String>,
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    let code: String = row.get(1)?;
    let platform = Platform::from_code(&code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown client type {code}").into(),
        )
    })?;
    Ok(Client {
        id: row.get(0)?,
        platform,
        handle: row.get(2)?,
        name: row.get(3)?,
    })
}

impl Store {
    pub fn find_client(&self, platform: Platform, handle: &str) -> Result<Option<Client>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, type, handle, name FROM clients WHERE type = ?1 AND handle = ?2",
            params![platform.code(), handle],
            row_to_client,
        )
        .optional()
        .context("Failed to look up client")
    }

    /// Resolve a platform handle to its client row, allocating a new person
    /// id when the handle is unseen. Returns the client and whether it was created.
    pub fn find_or_create_client(
        &self,
        platform: Platform,
        handle: &str,
        name: Option<&str>,
    ) -> Result<(Client, bool)> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        if let Some(client) = tx
            .query_row(
                "SELECT id, type, handle, name FROM clients WHERE type = ?1 AND handle = ?2",
                params![platform.code(), handle],
                row_to_client,
            )
            .optional()?
        {
            return Ok((client, false));
        }

        let id: i64 = tx.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM clients", [], |r| {
            r.get(0)
        })?;
        tx.execute(
            "INSERT INTO clients (id, type, handle, name, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, platform.code(), handle, name, now_ts()],
        )?;
        tx.commit().context("Failed to create client")?;
        Ok((
            Client {
                id,
                platform,
                handle: handle.to_string(),
                name: name.map(str::to_string),
            },
            true,
        ))
    }

    /// Attach a platform identity to an existing person, replacing any
    /// previous identity of that type and any other owner of the handle.
    pub fn link_client(&self, id: i64, platform: Platform, handle: &str) -> Result<Client> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let name: Option<String> = tx
            .query_row(
                "SELECT name FROM clients WHERE id = ?1 AND name IS NOT NULL LIMIT 1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        tx.execute(
            "DELETE FROM clients WHERE (id = ?1 AND type = ?2) OR (type = ?2 AND handle = ?3)",
            params![id, platform.code(), handle],
        )?;
        tx.execute(
            "INSERT INTO clients (id, type, handle, name, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, platform.code(), handle, name, now_ts()],
        )?;
        tx.commit().context("Failed to link client")?;
        Ok(Client {
            id,
            platform,
            handle: handle.to_string(),
            name,
        })
    }

    /// All platform identities of one person.
    pub fn client_identities(&self, id: i64) -> Result<Vec<Client>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT id, type, handle, name FROM clients WHERE id = ?1 ORDER BY type")?;
        let rows = stmt
            .query_map(params![id], row_to_client)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list client identities")?;
        Ok(rows)
    }

    pub fn client_exists(&self, id: i64) -> Result<bool> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row("SELECT 1 FROM clients WHERE id = ?1 LIMIT 1", params![id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn set_client_name(&self, id: i64, name: &str) -> Result<()> {
        self.lock_conn()
            .execute("UPDATE clients SET name = ?2 WHERE id = ?1", params![id, name])
            .context("Failed to update client name")?;
        Ok(())
    }

    /// Append to the conversation log. `direction` is `in` or `out`.
    pub fn log_event(
        &self,
        client_id: i64,
        direction: &str,
        text: &str,
        action: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO event_log (client_id, direction, text, action, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![client_id, direction, text, action, session_id, now_ts()],
            )
            .context("Failed to write event log")?;
        Ok(())
    }

    pub fn event_count(&self, client_id: i64) -> Result<i64> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE client_id = ?1",
            params![client_id],
            |r| r.get(0),
        )
        .context("Failed to count events")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_handles_get_new_ids() {
        let store = Store::open_in_memory().unwrap();
        let (a, created) = store
            .find_or_create_client(Platform::Facebook, "100", Some("Susan"))
            .unwrap();
        assert!(created);
        let (b, _) = store.find_or_create_client(Platform::Facebook, "200", None).unwrap();
        assert_ne!(a.id, b.id);

        let (again, created) = store.find_or_create_client(Platform::Facebook, "100", None).unwrap();
        assert!(!created);
        assert_eq!(again, a);
    }

    #[test]
    fn same_handle_on_other_platform_is_other_client() {
        let store = Store::open_in_memory().unwrap();
        let (fb, _) = store.find_or_create_client(Platform::Facebook, "42", None).unwrap();
        let (ad, _) = store.find_or_create_client(Platform::Alterdesk, "42", None).unwrap();
        assert_ne!(fb.id, ad.id);
    }

    #[test]
    fn linked_identity_shares_id_and_name() {
        let store = Store::open_in_memory().unwrap();
        let (fb, _) = store
            .find_or_create_client(Platform::Facebook, "42", Some("Susan"))
            .unwrap();
        let sf = store.link_client(fb.id, Platform::Salesforce, "003A").unwrap();
        assert_eq!(sf.id, fb.id);
        assert_eq!(sf.name.as_deref(), Some("Susan"));

        // Relinking replaces the old Salesforce handle.
        store.link_client(fb.id, Platform::Salesforce, "003B").unwrap();
        let identities = store.client_identities(fb.id).unwrap();
        assert_eq!(identities.len(), 2);
        assert!(store.find_client(Platform::Salesforce, "003A").unwrap().is_none());
        assert_eq!(
            store.find_client(Platform::Salesforce, "003B").unwrap().unwrap().id,
            fb.id
        );
    }

    #[test]
    fn events_are_logged() {
        let store = Store::open_in_memory().unwrap();
        let (client, _) = store.find_or_create_client(Platform::Facebook, "1", None).unwrap();
        store.log_event(client.id, "in", "Hoi", None, Some("s")).unwrap();
        store.log_event(client.id, "out", "Hallo!", Some("who_are_you"), Some("s")).unwrap();
        assert_eq!(store.event_count(client.id).unwrap(), 2);
        assert!(store.client_exists(client.id).unwrap());
        assert!(!store.client_exists(999).unwrap());
    }
}

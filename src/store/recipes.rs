use super::Store;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub ingredients: String,
    pub tags: String,
}

fn row_to_recipe(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recipe> {
    Ok(Recipe {
        id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        ingredients: row.get(3)?,
        tags: row.get(4)?,
    })
}

impl Store {
    pub fn insert_recipe(&self, title: &str, url: &str, ingredients: &str, tags: &str) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO recipes (title, url, ingredients, tags) VALUES (?1, ?2, ?3, ?4)",
            params![title, url, ingredients, tags],
        )
        .context("Failed to insert recipe")?;
        Ok(conn.last_insert_rowid())
    }

    /// Case-insensitive match on title, ingredients or tags.
    pub fn search_recipes(&self, term: &str, limit: usize) -> Result<Vec<Recipe>> {
        let pattern = format!(
            "%{}%",
            term.trim()
                .to_lowercase()
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_")
        );
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, url, ingredients, tags FROM recipes
             WHERE lower(title) LIKE ?1 ESCAPE '\\'
                OR lower(ingredients) LIKE ?1 ESCAPE '\\'
                OR lower(tags) LIKE ?1 ESCAPE '\\'
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![pattern, i64::try_from(limit).unwrap_or(i64::MAX)], row_to_recipe)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to search recipes")?;
        Ok(rows)
    }

    pub fn recipe(&self, id: i64) -> Result<Option<Recipe>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, title, url, ingredients, tags FROM recipes WHERE id = ?1",
            params![id],
            row_to_recipe,
        )
        .optional()
        .context("Failed to read recipe")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_matches_title_ingredients_and_tags() {
        let store = Store::open_in_memory().unwrap();
        let soup = store
            .insert_recipe("Linzensoep", "https://r.example/1", "linzen, ui", "zoutarm")
            .unwrap();
        store
            .insert_recipe("Havermout", "https://r.example/2", "havermout, melk", "ontbijt")
            .unwrap();

        assert_eq!(store.search_recipes("SOEP", 5).unwrap()[0].id, soup);
        assert_eq!(store.search_recipes("melk", 5).unwrap().len(), 1);
        assert_eq!(store.search_recipes("zoutarm", 5).unwrap()[0].id, soup);
        assert!(store.search_recipes("100%", 5).unwrap().is_empty());
        assert_eq!(store.search_recipes("", 1).unwrap().len(), 1);
        assert_eq!(store.recipe(soup).unwrap().unwrap().title, "Linzensoep");
    }
}

use std::path::Path;

use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::StorageError;
use crate::model::{Author, Category, CookingStep, Key, Record, Recipe};

/// What the ingestion pipeline needs from a store.
///
/// `insert` of a recipe writes the row only; the category set is written
/// separately through `set_categories`.
pub trait Storage {
    fn find(&self, key: Key<'_>) -> Result<Option<Record>, StorageError>;
    fn insert(&self, record: Record) -> Result<Record, StorageError>;
    fn update(&self, record: &Record) -> Result<(), StorageError>;
    fn delete(&self, record: &Record) -> Result<(), StorageError>;
    fn set_categories(&self, recipe_id: i64, category_ids: &[i64]) -> Result<(), StorageError>;
    /// Steps of a recipe in ascending order.
    fn steps_of(&self, recipe_id: i64) -> Result<Vec<CookingStep>, StorageError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = SqliteStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS authors (
                id           INTEGER PRIMARY KEY,
                title_source TEXT,
                title_target TEXT,
                website      TEXT,
                email        TEXT,
                image        TEXT
            );

            CREATE TABLE IF NOT EXISTS categories (
                id           INTEGER PRIMARY KEY,
                title_source TEXT,
                title_target TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_categories_title ON categories(title_source);

            CREATE TABLE IF NOT EXISTS recipes (
                id             INTEGER PRIMARY KEY,
                origin_id      TEXT UNIQUE NOT NULL,
                title_source   TEXT NOT NULL,
                title_target   TEXT,
                self_link      TEXT NOT NULL,
                alternate_link TEXT NOT NULL,
                published_date TEXT NOT NULL,
                updated_date   TEXT NOT NULL,
                crawled_date   TEXT NOT NULL,
                author_id      INTEGER REFERENCES authors(id),
                translated     BOOLEAN NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS recipe_categories (
                recipe_id   INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                category_id INTEGER NOT NULL REFERENCES categories(id),
                UNIQUE(recipe_id, category_id)
            );

            CREATE TABLE IF NOT EXISTS cooking_steps (
                id                 INTEGER PRIMARY KEY,
                recipe_id          INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                step_order         INTEGER NOT NULL CHECK(step_order >= 1),
                image_url          TEXT NOT NULL,
                description_source TEXT NOT NULL,
                description_target TEXT,
                UNIQUE(recipe_id, step_order)
            );
            CREATE INDEX IF NOT EXISTS idx_steps_recipe ON cooking_steps(recipe_id);
            ",
        )?;
        Ok(())
    }

    fn recipe_where(&self, clause: &str, param: &dyn rusqlite::ToSql) -> Result<Option<Recipe>, StorageError> {
        let sql = format!(
            "SELECT r.id, r.origin_id, r.title_source, r.title_target, r.self_link, r.alternate_link,
                    r.published_date, r.updated_date, r.crawled_date, r.author_id, r.translated,
                    COALESCE(a.title_target, a.title_source, '')
             FROM recipes r LEFT JOIN authors a ON a.id = r.author_id
             WHERE {}",
            clause
        );
        let recipe = self.conn.query_row(&sql, [param], recipe_from_row).optional()?;
        let Some(mut recipe) = recipe else {
            return Ok(None);
        };
        if let Some(id) = recipe.id {
            let mut stmt = self.conn.prepare(
                "SELECT c.id, COALESCE(c.title_source, '')
                 FROM recipe_categories rc JOIN categories c ON c.id = rc.category_id
                 WHERE rc.recipe_id = ?1 ORDER BY rc.rowid",
            )?;
            let pairs = stmt
                .query_map([id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (cid, name) in pairs {
                recipe.category_ids.push(cid);
                recipe.category_names.push(name);
            }
        }
        Ok(Some(recipe))
    }

    pub fn recipe_by_id(&self, id: i64) -> Result<Option<Recipe>, StorageError> {
        self.recipe_where("r.id = ?1", &id)
    }

    pub fn recipe_ids(&self) -> Result<Vec<i64>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT id FROM recipes ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn stats(&self) -> Result<Stats, StorageError> {
        let count = |sql: &str| -> Result<usize, StorageError> {
            Ok(self.conn.query_row(sql, [], |r| r.get(0))?)
        };
        Ok(Stats {
            recipes: count("SELECT COUNT(*) FROM recipes")?,
            steps: count("SELECT COUNT(*) FROM cooking_steps")?,
            authors: count("SELECT COUNT(*) FROM authors")?,
            categories: count("SELECT COUNT(*) FROM categories")?,
            without_author: count("SELECT COUNT(*) FROM recipes WHERE author_id IS NULL")?,
            translated: count("SELECT COUNT(*) FROM recipes WHERE translated = 1")?,
        })
    }
}

pub struct Stats {
    pub recipes: usize,
    pub steps: usize,
    pub authors: usize,
    pub categories: usize,
    pub without_author: usize,
    pub translated: usize,
}

impl Storage for SqliteStore {
    fn find(&self, key: Key<'_>) -> Result<Option<Record>, StorageError> {
        let record = match key {
            Key::AuthorName(name) => self
                .conn
                .query_row(
                    "SELECT id, title_source, title_target, website, email, image FROM authors
                     WHERE title_target = ?1 OR title_source = ?1 ORDER BY id LIMIT 1",
                    [name],
                    author_from_row,
                )
                .optional()?
                .map(Record::Author),
            Key::CategoryTitle(title) => self
                .conn
                .query_row(
                    "SELECT id, title_source, title_target FROM categories
                     WHERE title_source = ?1 ORDER BY id LIMIT 1",
                    [title],
                    category_from_row,
                )
                .optional()?
                .map(Record::Category),
            Key::RecipeOrigin(origin_id) => self
                .recipe_where("r.origin_id = ?1", &origin_id)?
                .map(Record::Recipe),
            Key::Step { recipe_id, order } => self
                .conn
                .query_row(
                    "SELECT id, recipe_id, step_order, image_url, description_source, description_target
                     FROM cooking_steps WHERE recipe_id = ?1 AND step_order = ?2",
                    params![recipe_id, order],
                    step_from_row,
                )
                .optional()?
                .map(Record::Step),
        };
        Ok(record)
    }

    fn insert(&self, record: Record) -> Result<Record, StorageError> {
        let what = record.kind();
        let result = match record {
            Record::Author(mut a) => {
                self.conn.execute(
                    "INSERT INTO authors (title_source, title_target, website, email, image)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![a.title_source, a.title_target, a.website, a.email, a.image],
                )?;
                a.id = Some(self.conn.last_insert_rowid());
                Record::Author(a)
            }
            Record::Category(mut c) => {
                self.conn.execute(
                    "INSERT INTO categories (title_source, title_target) VALUES (?1, ?2)",
                    params![c.title_source, c.title_target],
                )?;
                c.id = Some(self.conn.last_insert_rowid());
                Record::Category(c)
            }
            Record::Recipe(mut r) => {
                self.conn
                    .execute(
                        "INSERT INTO recipes
                         (origin_id, title_source, title_target, self_link, alternate_link,
                          published_date, updated_date, crawled_date, author_id, translated)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            r.origin_id, r.title_source, r.title_target, r.self_link, r.alternate_link,
                            r.published_date.to_rfc3339(), r.updated_date.to_rfc3339(),
                            r.crawled_date.to_rfc3339(), r.author_id, r.translated,
                        ],
                    )
                    .map_err(|e| classify(e, format!("recipe {}", r.origin_id)))?;
                r.id = Some(self.conn.last_insert_rowid());
                Record::Recipe(r)
            }
            Record::Step(mut s) => {
                let recipe_id = s
                    .recipe_id
                    .ok_or_else(|| StorageError::NotFound(format!("recipe for step {}", s.order)))?;
                self.conn
                    .execute(
                        "INSERT INTO cooking_steps
                         (recipe_id, step_order, image_url, description_source, description_target)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![recipe_id, s.order, s.image_url, s.description_source, s.description_target],
                    )
                    .map_err(|e| classify(e, format!("step {} of recipe {}", s.order, recipe_id)))?;
                s.id = Some(self.conn.last_insert_rowid());
                Record::Step(s)
            }
        };
        tracing::trace!("inserted {}", what);
        Ok(result)
    }

    fn update(&self, record: &Record) -> Result<(), StorageError> {
        let changed = match record {
            Record::Author(a) => self.conn.execute(
                "UPDATE authors SET title_source = ?2, title_target = ?3, website = ?4, email = ?5, image = ?6
                 WHERE id = ?1",
                params![id_of(a.id, record)?, a.title_source, a.title_target, a.website, a.email, a.image],
            )?,
            Record::Category(c) => self.conn.execute(
                "UPDATE categories SET title_source = ?2, title_target = ?3 WHERE id = ?1",
                params![id_of(c.id, record)?, c.title_source, c.title_target],
            )?,
            Record::Recipe(r) => self.conn.execute(
                "UPDATE recipes SET title_source = ?2, title_target = ?3, self_link = ?4,
                        alternate_link = ?5, published_date = ?6, updated_date = ?7,
                        author_id = ?8, translated = ?9
                 WHERE id = ?1",
                params![
                    id_of(r.id, record)?, r.title_source, r.title_target, r.self_link, r.alternate_link,
                    r.published_date.to_rfc3339(), r.updated_date.to_rfc3339(), r.author_id, r.translated,
                ],
            )?,
            Record::Step(s) => self
                .conn
                .execute(
                    "UPDATE cooking_steps SET step_order = ?2, image_url = ?3,
                            description_source = ?4, description_target = ?5
                     WHERE id = ?1",
                    params![id_of(s.id, record)?, s.order, s.image_url, s.description_source, s.description_target],
                )
                .map_err(|e| classify(e, format!("step order {}", s.order)))?,
        };
        if changed == 0 {
            return Err(StorageError::NotFound(record.kind().to_string()));
        }
        Ok(())
    }

    fn delete(&self, record: &Record) -> Result<(), StorageError> {
        let (table, id) = match record {
            Record::Author(a) => ("authors", a.id),
            Record::Category(c) => ("categories", c.id),
            Record::Recipe(r) => ("recipes", r.id),
            Record::Step(s) => ("cooking_steps", s.id),
        };
        let id = id_of(id, record)?;
        let changed = self
            .conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("{} {}", record.kind(), id)));
        }
        Ok(())
    }

    fn set_categories(&self, recipe_id: i64, category_ids: &[i64]) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM recipe_categories WHERE recipe_id = ?1", [recipe_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO recipe_categories (recipe_id, category_id) VALUES (?1, ?2)",
            )?;
            for category_id in category_ids {
                stmt.execute(params![recipe_id, category_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn steps_of(&self, recipe_id: i64) -> Result<Vec<CookingStep>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recipe_id, step_order, image_url, description_source, description_target
             FROM cooking_steps WHERE recipe_id = ?1 ORDER BY step_order",
        )?;
        let steps = stmt
            .query_map([recipe_id], step_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }
}

fn classify(e: rusqlite::Error, what: String) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::ConstraintViolation
                && f.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StorageError::Conflict(what)
        }
        _ => StorageError::Sqlite(e),
    }
}

fn id_of(id: Option<i64>, record: &Record) -> Result<i64, StorageError> {
    id.ok_or_else(|| StorageError::NotFound(format!("unsaved {}", record.kind())))
}

fn author_from_row(row: &Row) -> rusqlite::Result<Author> {
    Ok(Author {
        id: row.get(0)?,
        title_source: row.get(1)?,
        title_target: row.get(2)?,
        website: row.get(3)?,
        email: row.get(4)?,
        image: row.get(5)?,
    })
}

fn category_from_row(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        title_source: row.get(1)?,
        title_target: row.get(2)?,
    })
}

fn step_from_row(row: &Row) -> rusqlite::Result<CookingStep> {
    Ok(CookingStep {
        id: row.get(0)?,
        recipe_id: row.get(1)?,
        order: row.get(2)?,
        image_url: row.get(3)?,
        description_source: row.get(4)?,
        description_target: row.get(5)?,
    })
}

fn recipe_from_row(row: &Row) -> rusqlite::Result<Recipe> {
    Ok(Recipe {
        id: row.get(0)?,
        origin_id: row.get(1)?,
        title_source: row.get(2)?,
        title_target: row.get(3)?,
        self_link: row.get(4)?,
        alternate_link: row.get(5)?,
        published_date: fixed_time(row, 6)?,
        updated_date: fixed_time(row, 7)?,
        crawled_date: fixed_time(row, 8)?.with_timezone(&Utc),
        author_id: row.get(9)?,
        translated: row.get(10)?,
        author_name: row.get(11)?,
        category_names: Vec::new(),
        category_ids: Vec::new(),
    })
}

fn fixed_time(row: &Row, idx: usize) -> rusqlite::Result<DateTime<FixedOffset>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

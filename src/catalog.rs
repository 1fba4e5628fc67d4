use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::db::Storage;
use crate::error::StorageError;
use crate::model::{Author, Category, Key, Record};
use crate::normalize::normalize;

/// Create a category for every feed term not stored yet. Returns how many
/// were created.
pub fn sync_categories<S: Storage + ?Sized>(
    store: &S,
    terms: &[String],
) -> Result<usize, StorageError> {
    let mut created = 0;
    for term in terms {
        let title = normalize(term);
        if title.is_empty() {
            continue;
        }
        if store.find(Key::CategoryTitle(&title))?.is_some() {
            debug!("Category exists: {}", title);
            continue;
        }
        store.insert(Record::Category(Category {
            title_source: Some(title.clone()),
            ..Category::default()
        }))?;
        info!("Category created: {}", title);
        created += 1;
    }
    Ok(created)
}

/// Input for `register_author`. Either title may be given.
#[derive(Debug, Default, Clone)]
pub struct NewAuthor {
    pub title_source: Option<String>,
    pub title_target: Option<String>,
    pub website: Option<String>,
    pub email: Option<String>,
}

/// Store an author unless one with either title already exists.
///
/// Returns the stored author and whether it was created.
pub fn register_author<S: Storage + ?Sized>(
    store: &S,
    new: NewAuthor,
) -> Result<(Author, bool)> {
    let title_source = clean(new.title_source);
    let title_target = clean(new.title_target);
    if title_source.is_none() && title_target.is_none() {
        bail!("author needs a name");
    }

    for name in [&title_target, &title_source].into_iter().flatten() {
        if let Some(Record::Author(existing)) = store.find(Key::AuthorName(name))? {
            return Ok((existing, false));
        }
    }

    let record = store.insert(Record::Author(Author {
        id: None,
        title_source,
        title_target,
        website: clean(new.website),
        email: clean(new.email),
        image: None,
    }))?;
    match record {
        Record::Author(author) => Ok((author, true)),
        other => bail!("expected author, stored {}", other.kind()),
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|v| normalize(&v)).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;

    #[test]
    fn sync_creates_only_missing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terms: Vec<String> = ["Dessert", "Quick", "Dessert", " ", "\u{064A}غذا"]
            .map(String::from)
            .to_vec();
        assert_eq!(sync_categories(&store, &terms).unwrap(), 3);
        assert_eq!(sync_categories(&store, &terms).unwrap(), 0);
        assert!(store
            .find(Key::CategoryTitle("\u{06CC}غذا"))
            .unwrap()
            .is_some());
        assert_eq!(store.stats().unwrap().categories, 3);
    }

    #[test]
    fn register_is_idempotent_on_either_title() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (author, created) = register_author(
            &store,
            NewAuthor {
                title_target: Some("Chef X".into()),
                title_source: Some("سرآشپز".into()),
                ..NewAuthor::default()
            },
        )
        .unwrap();
        assert!(created);
        assert!(author.id.is_some());

        let (again, created) = register_author(
            &store,
            NewAuthor {
                title_source: Some("سرآشپز".into()),
                ..NewAuthor::default()
            },
        )
        .unwrap();
        assert!(!created);
        assert_eq!(again.id, author.id);
        assert_eq!(store.stats().unwrap().authors, 1);
    }

    #[test]
    fn register_requires_a_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = register_author(
            &store,
            NewAuthor {
                title_target: Some("  ".into()),
                ..NewAuthor::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs a name"));
    }
}

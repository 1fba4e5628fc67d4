use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::db::Storage;
use crate::error::{IngestError, StorageError};
use crate::model::{CookingStep, FeedEntry, Key, Record, Recipe};
use crate::normalize::canonical_letters;

/// Outcome of a successful `ingest`. Non-fatal problems are listed in `issues`.
#[derive(Debug)]
pub struct IngestReport {
    pub recipe_id: i64,
    pub steps_written: usize,
    pub categories_linked: usize,
    pub issues: Vec<IngestError>,
}

/// Dedupe, resolve references and persist one recipe with its steps.
pub struct IngestionPipeline<'a, S: Storage + ?Sized> {
    store: &'a S,
}

impl<'a, S: Storage + ?Sized> IngestionPipeline<'a, S> {
    pub fn new(store: &'a S) -> Self {
        IngestionPipeline { store }
    }

    pub fn ingest(
        &self,
        entry: &FeedEntry,
        mut recipe: Recipe,
        mut steps: Vec<CookingStep>,
    ) -> Result<IngestReport, IngestError> {
        recipe.canonicalize();
        steps.iter_mut().for_each(CookingStep::canonicalize);
        if recipe.author_name.is_empty() {
            recipe.author_name = canonical_letters(&entry.author_name);
        }
        if recipe.origin_id != entry.origin_id {
            warn!(
                "Feed entry {} resolved to document {}",
                entry.origin_id, recipe.origin_id
            );
        }

        if self.store.find(Key::RecipeOrigin(&recipe.origin_id))?.is_some() {
            warn!("Duplicate: recipe {} ({})", recipe.origin_id, recipe.title_source);
            return Err(IngestError::Duplicate(recipe.origin_id));
        }

        let mut issues = Vec::new();
        recipe.author_id = self.resolve_author(&recipe.author_name)?;
        if recipe.author_id.is_none() {
            let err = IngestError::AuthorNotFound(recipe.author_name.clone());
            warn!("Recipe {}: {}", recipe.origin_id, err);
            issues.push(err);
        }
        let category_ids = self.resolve_categories(&recipe.origin_id, &recipe.category_names)?;

        steps.sort_by_key(|s| s.order);
        for (i, step) in steps.iter_mut().enumerate() {
            step.order = i as u32 + 1;
        }
        recipe.translated = recipe.translation_complete(&steps);

        let origin_id = recipe.origin_id.clone();
        let recipe_id = match self.store.insert(Record::Recipe(recipe)) {
            Ok(saved) => saved
                .id()
                .ok_or_else(|| StorageError::NotFound(format!("id of recipe {}", origin_id)))?,
            Err(StorageError::Conflict(_)) => {
                warn!("Duplicate: recipe {} inserted concurrently", origin_id);
                return Err(IngestError::Duplicate(origin_id));
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Created recipe {} (id {})", origin_id, recipe_id);

        let total = steps.len();
        let degraded = |written: usize, e: StorageError| -> IngestError {
            error!(
                "Recipe {} left with {} of {} steps: {}",
                origin_id, written, total, e
            );
            IngestError::StorageFailure(e)
        };

        self.store
            .set_categories(recipe_id, &category_ids)
            .map_err(|e| degraded(0, e))?;

        for (written, mut step) in steps.into_iter().enumerate() {
            step.recipe_id = Some(recipe_id);
            self.store
                .insert(Record::Step(step))
                .map_err(|e| degraded(written, e))?;
        }

        Ok(IngestReport {
            recipe_id,
            steps_written: total,
            categories_linked: category_ids.len(),
            issues,
        })
    }

    fn resolve_author(&self, name: &str) -> Result<Option<i64>, StorageError> {
        if name.is_empty() {
            return Ok(None);
        }
        Ok(self.store.find(Key::AuthorName(name))?.and_then(|r| r.id()))
    }

    fn resolve_categories(&self, origin_id: &str, names: &[String]) -> Result<Vec<i64>, StorageError> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            match self.store.find(Key::CategoryTitle(name))?.and_then(|r| r.id()) {
                Some(id) if !ids.contains(&id) => ids.push(id),
                Some(_) => {}
                None => warn!("Recipe {}: {}", origin_id, IngestError::CategoryNotFound(name.clone())),
            }
        }
        Ok(ids)
    }
}

// ── Step merge ──

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub removed: usize,
    pub updated: usize,
}

/// Folds steps whose image is a decorative marker into the step before them.
pub struct StepMerge {
    marker: Regex,
}

impl StepMerge {
    pub fn new(marker_pattern: &str) -> Result<Self, regex::Error> {
        Ok(StepMerge {
            marker: Regex::new(marker_pattern)?,
        })
    }

    pub fn is_marker(&self, image_url: &str) -> bool {
        self.marker.is_match(image_url)
    }

    /// Returns the surviving steps renumbered `1..N`, and the removed ones.
    ///
    /// Scans from the last step down; the first step has no predecessor and is kept.
    pub fn merge(&self, mut steps: Vec<CookingStep>) -> (Vec<CookingStep>, Vec<CookingStep>) {
        steps.sort_by_key(|s| s.order);
        let mut removed = Vec::new();
        let mut i = steps.len();
        while i > 1 {
            i -= 1;
            if !self.is_marker(&steps[i].image_url) {
                continue;
            }
            let step = steps.remove(i);
            let prev = &mut steps[i - 1];
            prev.description_source = join(&prev.description_source, &step.description_source);
            prev.description_target = match (prev.description_target.take(), &step.description_target) {
                (None, None) => None,
                (a, b) => Some(join(a.as_deref().unwrap_or(""), b.as_deref().unwrap_or(""))),
            };
            removed.push(step);
        }
        for (i, step) in steps.iter_mut().enumerate() {
            step.order = i as u32 + 1;
        }
        (steps, removed)
    }

    /// Merge a stored recipe's steps in place and refresh its `translated` flag.
    pub fn apply<S: Storage + ?Sized>(
        &self,
        store: &S,
        recipe: &mut Recipe,
    ) -> Result<MergeReport, StorageError> {
        let recipe_id = recipe
            .id
            .ok_or_else(|| StorageError::NotFound(format!("unsaved recipe {}", recipe.origin_id)))?;
        let before = store.steps_of(recipe_id)?;
        let original: HashMap<Option<i64>, CookingStep> =
            before.iter().map(|s| (s.id, s.clone())).collect();
        let (kept, removed) = self.merge(before);

        let mut report = MergeReport::default();
        // deletes first so renumbering only moves steps into free slots
        for step in &removed {
            store.delete(&Record::Step(step.clone()))?;
            report.removed += 1;
        }
        for step in &kept {
            if original.get(&step.id) != Some(step) {
                store.update(&Record::Step(step.clone()))?;
                report.updated += 1;
            }
        }

        let translated = recipe.translation_complete(&kept);
        if translated != recipe.translated {
            recipe.translated = translated;
            store.update(&Record::Recipe(recipe.clone()))?;
        }
        if report.removed > 0 {
            info!(
                "Recipe {}: folded {} marker steps, {} remain",
                recipe.origin_id,
                report.removed,
                kept.len()
            );
        }
        Ok(report)
    }
}

fn join(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (_, true) => a.to_string(),
        (true, false) => b.to_string(),
        (false, false) => format!("{} {}", a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::model::tests::sample_recipe;
    use crate::model::{Author, Category};

    const MARKER: &str = r"(?i)emoticon";

    fn entry_for(recipe: &Recipe) -> FeedEntry {
        FeedEntry {
            origin_id: recipe.origin_id.clone(),
            title: recipe.title_source.clone(),
            published_date: recipe.published_date,
            updated_date: recipe.updated_date,
            self_link: recipe.self_link.clone(),
            alternate_link: recipe.alternate_link.clone(),
            author_name: recipe.author_name.clone(),
            category_names: recipe.category_names.clone(),
        }
    }

    fn steps(images: &[&str]) -> Vec<CookingStep> {
        images
            .iter()
            .enumerate()
            .map(|(i, img)| CookingStep::new(i as u32 + 1, img.to_string(), format!("text {}", i + 1)))
            .collect()
    }

    fn seeded_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(Record::Author(Author {
                title_target: Some("Chef X".into()),
                ..Author::default()
            }))
            .unwrap();
        store
            .insert(Record::Category(Category {
                title_source: Some("Dessert".into()),
                ..Category::default()
            }))
            .unwrap();
        store
    }

    fn ingest(store: &SqliteStore, recipe: Recipe, images: &[&str]) -> Result<IngestReport, IngestError> {
        let entry = entry_for(&recipe);
        IngestionPipeline::new(store).ingest(&entry, recipe, steps(images))
    }

    #[test]
    fn persists_recipe_steps_and_refs() {
        let store = seeded_store();
        let report = ingest(&store, sample_recipe("1"), &["a.jpg", "b.jpg", "c.jpg"]).unwrap();
        assert_eq!(report.steps_written, 3);
        // "Quick" has no category row and is dropped quietly
        assert_eq!(report.categories_linked, 1);
        assert!(report.issues.is_empty());

        let recipe = store.recipe_by_id(report.recipe_id).unwrap().unwrap();
        assert!(recipe.author_id.is_some());
        assert_eq!(recipe.category_names, vec!["Dessert"]);
        assert!(!recipe.translated);
        let orders: Vec<u32> = store.steps_of(report.recipe_id).unwrap().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_leaves_storage_unchanged() {
        let store = seeded_store();
        ingest(&store, sample_recipe("1"), &["a.jpg"]).unwrap();
        let before = store.stats().unwrap();

        let mut again = sample_recipe("1");
        again.title_source = "Changed upstream".into();
        let err = ingest(&store, again, &["x.jpg", "y.jpg"]).unwrap_err();
        assert!(matches!(err, IngestError::Duplicate(ref id) if id == "1"));

        let after = store.stats().unwrap();
        assert_eq!((before.recipes, before.steps), (after.recipes, after.steps));
        let Some(Record::Recipe(stored)) = store.find(Key::RecipeOrigin("1")).unwrap() else {
            panic!("missing recipe");
        };
        assert_eq!(stored.title_source, "Recipe A");
    }

    #[test]
    fn missing_author_is_recorded_but_persisted() {
        let store = seeded_store();
        let mut recipe = sample_recipe("2");
        recipe.author_name = "Somebody Else".into();
        let report = ingest(&store, recipe, &["a.jpg"]).unwrap();
        assert!(matches!(
            report.issues.as_slice(),
            [IngestError::AuthorNotFound(name)] if name == "Somebody Else"
        ));
        let recipe = store.recipe_by_id(report.recipe_id).unwrap().unwrap();
        assert!(recipe.author_id.is_none());
        assert_eq!(store.steps_of(report.recipe_id).unwrap().len(), 1);
    }

    #[test]
    fn text_fields_are_canonicalized() {
        let store = seeded_store();
        let mut recipe = sample_recipe("3");
        recipe.title_source = "\u{0634}\u{064A}\u{0631}".into();
        let mut s = steps(&["a.jpg"]);
        s[0].description_source = "\u{064A}".into();
        let entry = entry_for(&recipe);
        let report = IngestionPipeline::new(&store).ingest(&entry, recipe, s).unwrap();

        let recipe = store.recipe_by_id(report.recipe_id).unwrap().unwrap();
        assert_eq!(recipe.title_source, "\u{0634}\u{06CC}\u{0631}");
        assert_eq!(store.steps_of(report.recipe_id).unwrap()[0].description_source, "\u{06CC}");
    }

    #[test]
    fn zero_steps_is_valid() {
        let store = seeded_store();
        let report = ingest(&store, sample_recipe("4"), &[]).unwrap();
        assert_eq!(report.steps_written, 0);
        assert!(store.steps_of(report.recipe_id).unwrap().is_empty());
    }

    /// SQLite underneath, with injected faults.
    struct FaultyStore {
        inner: SqliteStore,
        fail_step: Option<u32>,
        blind_origin_lookup: bool,
    }

    impl FaultyStore {
        fn new(inner: SqliteStore) -> Self {
            FaultyStore {
                inner,
                fail_step: None,
                blind_origin_lookup: false,
            }
        }
    }

    impl Storage for FaultyStore {
        fn find(&self, key: Key<'_>) -> Result<Option<Record>, StorageError> {
            if self.blind_origin_lookup && matches!(key, Key::RecipeOrigin(_)) {
                return Ok(None);
            }
            self.inner.find(key)
        }

        fn insert(&self, record: Record) -> Result<Record, StorageError> {
            if let Record::Step(step) = &record {
                if Some(step.order) == self.fail_step {
                    return Err(StorageError::Io(std::io::Error::other("disk full")));
                }
            }
            self.inner.insert(record)
        }

        fn update(&self, record: &Record) -> Result<(), StorageError> {
            self.inner.update(record)
        }

        fn delete(&self, record: &Record) -> Result<(), StorageError> {
            self.inner.delete(record)
        }

        fn set_categories(&self, recipe_id: i64, category_ids: &[i64]) -> Result<(), StorageError> {
            self.inner.set_categories(recipe_id, category_ids)
        }

        fn steps_of(&self, recipe_id: i64) -> Result<Vec<CookingStep>, StorageError> {
            self.inner.steps_of(recipe_id)
        }
    }

    #[test]
    fn step_failure_keeps_recipe_with_partial_steps() {
        let store = FaultyStore {
            fail_step: Some(2),
            ..FaultyStore::new(seeded_store())
        };
        let recipe = sample_recipe("7");
        let entry = entry_for(&recipe);
        let err = IngestionPipeline::new(&store)
            .ingest(&entry, recipe, steps(&["a.jpg", "b.jpg", "c.jpg"]))
            .unwrap_err();
        assert!(matches!(err, IngestError::StorageFailure(StorageError::Io(_))));

        let Some(Record::Recipe(saved)) = store.inner.find(Key::RecipeOrigin("7")).unwrap() else {
            panic!("recipe row missing");
        };
        assert_eq!(saved.category_names, vec!["Dessert"]);
        let orders: Vec<u32> = store.inner.steps_of(saved.id.unwrap()).unwrap().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1]);
    }

    #[test]
    fn insert_conflict_after_lookup_miss_is_duplicate() {
        let inner = seeded_store();
        ingest(&inner, sample_recipe("8"), &["a.jpg"]).unwrap();
        let store = FaultyStore {
            blind_origin_lookup: true,
            ..FaultyStore::new(inner)
        };

        let recipe = sample_recipe("8");
        let entry = entry_for(&recipe);
        let err = IngestionPipeline::new(&store)
            .ingest(&entry, recipe, steps(&["x.jpg", "y.jpg"]))
            .unwrap_err();
        assert!(matches!(err, IngestError::Duplicate(ref id) if id == "8"));
        let stats = store.inner.stats().unwrap();
        assert_eq!((stats.recipes, stats.steps), (1, 1));
    }

    #[test]
    fn merge_folds_marker_into_predecessor() {
        let merge = StepMerge::new(MARKER).unwrap();
        let (kept, removed) = merge.merge(steps(&["a.jpg", "b.jpg", "icons/emoticon.gif", "d.jpg"]));
        assert_eq!(removed.len(), 1);
        let orders: Vec<u32> = kept.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(kept[1].description_source, "text 2 text 3");
        assert_eq!(kept[2].image_url, "d.jpg");
        assert_eq!(kept[2].description_source, "text 4");
    }

    #[test]
    fn merge_chains_consecutive_markers() {
        let merge = StepMerge::new(MARKER).unwrap();
        let (kept, _) = merge.merge(steps(&["a.jpg", "emoticon1.gif", "emoticon2.gif"]));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].description_source, "text 1 text 2 text 3");
    }

    #[test]
    fn merge_keeps_leading_marker_and_is_idempotent() {
        let merge = StepMerge::new(MARKER).unwrap();
        let (once, removed) = merge.merge(steps(&["emoticon.gif", "b.jpg", "emoticon.gif"]));
        assert_eq!(removed.len(), 1);
        assert_eq!(once.len(), 2);
        assert_eq!(once[0].image_url, "emoticon.gif");
        let (twice, removed) = merge.merge(once.clone());
        assert!(removed.is_empty());
        assert_eq!(twice, once);
    }

    #[test]
    fn merge_joins_target_text() {
        let merge = StepMerge::new(MARKER).unwrap();
        let mut s = steps(&["a.jpg", "emoticon.gif"]);
        s[1].description_target = Some("done".into());
        let (kept, _) = merge.merge(s);
        assert_eq!(kept[0].description_target.as_deref(), Some("done"));
    }

    #[test]
    fn apply_persists_merge_and_refreshes_translation() {
        let store = seeded_store();
        let mut recipe = sample_recipe("5");
        recipe.title_target = Some("Recipe A".into());
        let report = ingest(&store, recipe, &["a.jpg", "emoticon.gif", "c.jpg", "emoticon.gif"]).unwrap();
        let id = report.recipe_id;

        // translate every step except the ones about to be folded
        for mut step in store.steps_of(id).unwrap() {
            if step.order % 2 == 1 {
                step.description_target = Some(format!("en {}", step.order));
                store.update(&Record::Step(step)).unwrap();
            }
        }

        let merge = StepMerge::new(MARKER).unwrap();
        let mut recipe = store.recipe_by_id(id).unwrap().unwrap();
        assert!(!recipe.translated);
        let result = merge.apply(&store, &mut recipe).unwrap();
        assert_eq!(result, MergeReport { removed: 2, updated: 2 });

        let stored = store.steps_of(id).unwrap();
        let orders: Vec<u32> = stored.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(stored[0].description_source, "text 1 text 2");
        assert_eq!(stored[1].image_url, "c.jpg");
        assert_eq!(stored[1].description_source, "text 3 text 4");
        assert!(store.recipe_by_id(id).unwrap().unwrap().translated);

        let again = merge.apply(&store, &mut recipe).unwrap();
        assert_eq!(again, MergeReport::default());
    }
}

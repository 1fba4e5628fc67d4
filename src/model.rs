use chrono::{DateTime, FixedOffset, Utc};

use crate::normalize::canonical_letters;

/// One item of the paginated feed listing.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub origin_id: String,
    pub title: String,
    pub published_date: DateTime<FixedOffset>,
    pub updated_date: DateTime<FixedOffset>,
    pub self_link: String,
    pub alternate_link: String,
    pub author_name: String,
    pub category_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub id: Option<i64>,
    pub origin_id: String,
    pub title_source: String,
    pub title_target: Option<String>,
    pub self_link: String,
    pub alternate_link: String,
    pub published_date: DateTime<FixedOffset>,
    pub updated_date: DateTime<FixedOffset>,
    pub crawled_date: DateTime<Utc>,
    /// Display name as scraped; resolved into `author_id` on ingest.
    pub author_name: String,
    /// Category terms as scraped; resolved into `category_ids` on ingest.
    pub category_names: Vec<String>,
    pub author_id: Option<i64>,
    pub category_ids: Vec<i64>,
    pub translated: bool,
}

impl Recipe {
    /// True once the title and every step carry non-empty target text.
    pub fn translation_complete(&self, steps: &[CookingStep]) -> bool {
        has_text(&self.title_target) && steps.iter().all(|s| has_text(&s.description_target))
    }

    /// Fold letter variants in every string field.
    pub fn canonicalize(&mut self) {
        self.origin_id = canonical_letters(&self.origin_id);
        self.title_source = canonical_letters(&self.title_source);
        self.title_target = self.title_target.as_deref().map(canonical_letters);
        self.self_link = canonical_letters(&self.self_link);
        self.alternate_link = canonical_letters(&self.alternate_link);
        self.author_name = canonical_letters(&self.author_name);
        for name in &mut self.category_names {
            *name = canonical_letters(name);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CookingStep {
    pub id: Option<i64>,
    pub image_url: String,
    pub description_source: String,
    pub description_target: Option<String>,
    /// 1-based, dense within a recipe.
    pub order: u32,
    pub recipe_id: Option<i64>,
}

impl CookingStep {
    pub fn new(order: u32, image_url: String, description_source: String) -> Self {
        CookingStep {
            id: None,
            image_url,
            description_source,
            description_target: None,
            order,
            recipe_id: None,
        }
    }

    pub fn canonicalize(&mut self) {
        self.image_url = canonical_letters(&self.image_url);
        self.description_source = canonical_letters(&self.description_source);
        self.description_target = self.description_target.as_deref().map(canonical_letters);
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Author {
    pub id: Option<i64>,
    pub title_source: Option<String>,
    pub title_target: Option<String>,
    pub website: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Category {
    pub id: Option<i64>,
    pub title_source: Option<String>,
    pub title_target: Option<String>,
}

/// Everything the storage port can persist.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Author(Author),
    Category(Category),
    Recipe(Recipe),
    Step(CookingStep),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Author(_) => "author",
            Record::Category(_) => "category",
            Record::Recipe(_) => "recipe",
            Record::Step(_) => "cooking_step",
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Record::Author(a) => a.id,
            Record::Category(c) => c.id,
            Record::Recipe(r) => r.id,
            Record::Step(s) => s.id,
        }
    }
}

/// Lookup keys, one per entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key<'a> {
    AuthorName(&'a str),
    CategoryTitle(&'a str),
    RecipeOrigin(&'a str),
    Step { recipe_id: i64, order: u32 },
}

fn has_text(s: &Option<String>) -> bool {
    s.as_deref().is_some_and(|t| !t.trim().is_empty())
}

/// Remove repeated names, keeping first occurrence order.
pub fn ordered_set(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

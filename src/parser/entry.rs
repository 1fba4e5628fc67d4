use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use super::content;
use crate::error::ParseError;
use crate::model::{ordered_set, CookingStep, Recipe};
use crate::normalize::normalize;

static POST_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"post-(\d+)").unwrap());

/// Extract the numeric origin id from a canonical id such as
/// `tag:blogger.com,1999:blog-123.post-456`.
pub fn origin_id(canonical_id: &str) -> Option<String> {
    POST_ID_RE
        .captures(canonical_id)
        .map(|caps| caps[1].to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextField {
    Id,
    Published,
    Updated,
    Title,
    AuthorName,
    Content,
}

#[derive(Debug, Default)]
struct EntryFields {
    id: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    title: Option<String>,
    author_name: Option<String>,
    content: Option<String>,
    self_link: Option<String>,
    alternate_link: Option<String>,
    categories: Vec<String>,
}

impl EntryFields {
    fn slot(&mut self, field: TextField) -> &mut Option<String> {
        match field {
            TextField::Id => &mut self.id,
            TextField::Published => &mut self.published,
            TextField::Updated => &mut self.updated,
            TextField::Title => &mut self.title,
            TextField::AuthorName => &mut self.author_name,
            TextField::Content => &mut self.content,
        }
    }
}

/// Parse an Atom entry document into a recipe and its ordered steps.
///
/// `origin_id_hint` is only consulted when the document has no `id` element.
pub fn parse_entry(
    document: &str,
    origin_id_hint: Option<&str>,
) -> Result<(Recipe, Vec<CookingStep>), ParseError> {
    let fields = read_fields(document)?;

    let origin_id = match fields.id.as_deref() {
        Some(id) => origin_id(id).ok_or(ParseError::MissingOriginId)?,
        None => origin_id_hint
            .map(str::trim)
            .filter(|h| !h.is_empty() && h.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .ok_or(ParseError::MissingOriginId)?,
    };

    let title = fields
        .title
        .as_deref()
        .map(normalize)
        .filter(|t| !t.is_empty())
        .ok_or(ParseError::IncompleteRecipe("title"))?;
    let published_date = timestamp(fields.published.as_deref(), "published")?;
    let updated_date = timestamp(fields.updated.as_deref(), "updated")?;
    let self_link = required_link(fields.self_link, "self_link")?;
    let alternate_link = required_link(fields.alternate_link, "alternate_link")?;

    let steps = content::split(fields.content.as_deref().unwrap_or_default())
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            CookingStep::new(i as u32 + 1, piece.image_url, normalize(&piece.description_html))
        })
        .collect();

    let recipe = Recipe {
        id: None,
        origin_id,
        title_source: title,
        title_target: None,
        self_link,
        alternate_link,
        published_date,
        updated_date,
        crawled_date: Utc::now(),
        author_name: fields.author_name.unwrap_or_default().trim().to_string(),
        category_names: ordered_set(fields.categories),
        author_id: None,
        category_ids: Vec::new(),
        translated: false,
    };

    Ok((recipe, steps))
}

fn read_fields(document: &str) -> Result<EntryFields, ParseError> {
    let mut reader = Reader::from_str(document);
    let mut fields = EntryFields::default();
    let mut path: Vec<Vec<u8>> = Vec::new();
    // (field, depth at which it was opened, accumulated text)
    let mut open: Option<(TextField, usize, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                read_attributes(&e, &name, &mut fields)?;
                if open.is_none() {
                    if let Some(field) = text_field(path.last().map(Vec::as_slice), &name) {
                        if fields.slot(field).is_none() {
                            open = Some((field, path.len(), String::new()));
                        }
                    }
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = e.local_name().as_ref().to_vec();
                read_attributes(&e, &name, &mut fields)?;
            }
            Ok(Event::Text(e)) => {
                if let Some((_, _, buf)) = open.as_mut() {
                    buf.push_str(&e.unescape().map_err(malformed)?);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some((_, _, buf)) = open.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
                if matches!(open, Some((_, depth, _)) if depth == path.len()) {
                    if let Some((field, _, text)) = open.take() {
                        *fields.slot(field) = Some(text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(e)),
            _ => {}
        }
    }

    Ok(fields)
}

fn text_field(parent: Option<&[u8]>, name: &[u8]) -> Option<TextField> {
    match (parent?, name) {
        (b"entry", b"id") => Some(TextField::Id),
        (b"entry", b"published") => Some(TextField::Published),
        (b"entry", b"updated") => Some(TextField::Updated),
        (b"entry", b"title") => Some(TextField::Title),
        (b"entry", b"content") => Some(TextField::Content),
        (b"author", b"name") => Some(TextField::AuthorName),
        _ => None,
    }
}

fn read_attributes(e: &BytesStart, name: &[u8], fields: &mut EntryFields) -> Result<(), ParseError> {
    match name {
        b"link" => {
            let rel = attribute(e, b"rel")?;
            let href = attribute(e, b"href")?;
            let slot = match rel.as_deref() {
                Some("self") => &mut fields.self_link,
                Some("alternate") => &mut fields.alternate_link,
                _ => return Ok(()),
            };
            if slot.is_none() {
                *slot = href;
            }
        }
        b"category" => {
            if let Some(term) = attribute(e, b"term")? {
                let term = term.trim();
                if !term.is_empty() {
                    fields.categories.push(term.to_string());
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn attribute(e: &BytesStart, key: &[u8]) -> Result<Option<String>, ParseError> {
    for attr in e.attributes() {
        let attr = attr.map_err(malformed)?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(attr.unescape_value().map_err(malformed)?.into_owned()));
        }
    }
    Ok(None)
}

fn timestamp(raw: Option<&str>, field: &'static str) -> Result<DateTime<FixedOffset>, ParseError> {
    raw.map(str::trim)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .ok_or(ParseError::IncompleteRecipe(field))
}

fn required_link(link: Option<String>, field: &'static str) -> Result<String, ParseError> {
    link.map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or(ParseError::IncompleteRecipe(field))
}

fn malformed(e: impl std::fmt::Display) -> ParseError {
    ParseError::MalformedDocument(e.to_string())
}

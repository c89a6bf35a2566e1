// src/ingest/feed.rs
//! RSS 2.0 / RSS 1.0 (RDF) / Atom parsing on top of the quick-xml event
//! reader. Element names are matched on their local part, so `content:encoded`,
//! `dc:date` and default-namespaced Atom all resolve the same way.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::error::{Classified, ErrorClass};
use crate::ingest::types::FeedItem;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed xml at byte {position}: {message}")]
    Xml { position: u64, message: String },
    #[error("document is not an RSS or Atom feed (root <{0}>)")]
    NotAFeed(String),
    #[error("document ended inside <{0}>")]
    Truncated(String),
}

impl Classified for ParseError {
    fn class(&self) -> ErrorClass {
        ErrorClass::PermanentLocal
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedDocument {
    pub title: Option<String>,
    pub items: Vec<FeedItem>,
}

/// Parse a feed body. Empty or whitespace-only bodies are an empty feed.
pub fn parse_feed(body: &str) -> Result<FeedDocument, ParseError> {
    let mut doc = FeedDocument::default();
    if body.trim().is_empty() {
        return Ok(doc);
    }

    let mut reader = Reader::from_str(body);
    let mut stack: Vec<String> = Vec::new();
    let mut root: Option<String> = None;
    // (depth of the <item>/<entry> element, item under construction)
    let mut item: Option<(usize, FeedItem)> = None;
    // (element name, depth) of the field whose text is being collected
    let mut field: Option<(String, usize)> = None;
    let mut buf = String::new();

    loop {
        let ev = match reader.read_event() {
            Ok(ev) => ev,
            Err(e) => {
                return Err(ParseError::Xml {
                    position: reader.buffer_position() as u64,
                    message: e.to_string(),
                })
            }
        };
        match ev {
            Event::Start(e) => {
                let name = local_name(&e);
                check_root(&mut root, &name)?;
                stack.push(name.clone());
                let depth = stack.len();

                if item.is_none() && (name == "item" || name == "entry") {
                    item = Some((depth, FeedItem::default()));
                    continue;
                }
                if field.is_some() {
                    // nested markup inside a field (Atom xhtml content); keep collecting
                    continue;
                }
                match &mut item {
                    Some((item_depth, it)) if depth == *item_depth + 1 => {
                        if name == "link" {
                            if let Some(href) = link_href(&e) {
                                it.link = Some(href);
                            }
                        }
                        buf.clear();
                        field = Some((name, depth));
                    }
                    None if name == "title" && is_channel_child(&stack) => {
                        buf.clear();
                        field = Some(("channel_title".to_string(), depth));
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                check_root(&mut root, &name)?;
                if let Some((item_depth, it)) = &mut item {
                    if stack.len() == *item_depth && name == "link" && it.link.is_none() {
                        it.link = link_href(&e);
                    }
                }
            }
            Event::Text(t) => {
                if field.is_some() {
                    match t.unescape() {
                        Ok(s) => buf.push_str(&s),
                        // HTML entities such as &nbsp; are not XML; keep them for the normalizer
                        Err(_) => buf.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Event::CData(c) => {
                if field.is_some() {
                    buf.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(_) => {
                let depth = stack.len();
                if let Some((name, fdepth)) = field.take() {
                    if fdepth == depth {
                        let value = std::mem::take(&mut buf);
                        match &mut item {
                            Some((_, it)) => assign_item_field(it, &name, value),
                            None => doc.title = non_empty(value),
                        }
                    } else {
                        field = Some((name, fdepth));
                    }
                }
                if matches!(&item, Some((d, _)) if *d == depth) {
                    if let Some((_, it)) = item.take() {
                        doc.items.push(it);
                    }
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match (root, stack.last()) {
        (None, _) => Err(ParseError::NotAFeed("none".into())),
        (Some(_), Some(open)) => Err(ParseError::Truncated(open.clone())),
        (Some(_), None) => Ok(doc),
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase()
}

fn check_root(root: &mut Option<String>, name: &str) -> Result<(), ParseError> {
    if root.is_some() {
        return Ok(());
    }
    if !matches!(name, "rss" | "feed" | "rdf") {
        return Err(ParseError::NotAFeed(name.to_string()));
    }
    *root = Some(name.to_string());
    Ok(())
}

fn is_channel_child(stack: &[String]) -> bool {
    stack.len() >= 2 && matches!(stack[stack.len() - 2].as_str(), "channel" | "feed")
}

/// Atom `<link href="..."/>`; only the alternate (or unlabelled) relation.
fn link_href(e: &BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut rel_ok = true;
    for attr in e.attributes().flatten() {
        let key = attr.key.local_name();
        let value = attr.unescape_value().ok()?.trim().to_string();
        match key.as_ref() {
            b"href" => href = non_empty(value),
            b"rel" => rel_ok = value == "alternate",
            _ => {}
        }
    }
    if rel_ok {
        href
    } else {
        None
    }
}

fn assign_item_field(it: &mut FeedItem, name: &str, value: String) {
    match name {
        "title" => it.title = non_empty(value),
        "link" => {
            if let Some(v) = non_empty(value) {
                it.link = Some(v);
            }
        }
        "guid" | "id" => it.guid = non_empty(value),
        "pubdate" | "published" | "date" => {
            if let Some(ts) = parse_feed_date(&value) {
                it.published_at = Some(ts);
            }
        }
        "updated" => {
            if it.published_at.is_none() {
                it.published_at = parse_feed_date(&value);
            }
        }
        "encoded" | "content" => it.content = non_empty(value),
        "description" | "summary" => it.summary = non_empty(value),
        _ => {}
    }
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// RFC 2822 (RSS) or RFC 3339 (Atom). `time` first, `chrono` for the obsolete
/// zone names (`GMT`, `EST`, ...) some feeds still emit.
pub fn parse_feed_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let from_time = |dt: OffsetDateTime| DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond());
    OffsetDateTime::parse(s, &Rfc2822)
        .ok()
        .and_then(from_time)
        .or_else(|| OffsetDateTime::parse(s, &Rfc3339).ok().and_then(from_time))
        .or_else(|| {
            DateTime::parse_from_rfc2822(s)
                .or_else(|_| DateTime::parse_from_rfc3339(s))
                .ok()
                .map(|d| d.with_timezone(&Utc))
        })
}

//! Embeddable `@font-face` CSS for the fonts a subtree actually uses.
//!
//! Rules are read from the document's stylesheets, narrowed to the applied
//! families, stripped of `local()` sources and rewritten so every remaining
//! source is a data URL. The result is cached under [`FONT_CACHE_KEY`].

use crate::cache::{CachedResource, ResourceCache};
use crate::dom::{Document, NodeId};
use crate::fetch::Fetch;
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, warn};
use std::collections::BTreeSet;

pub const FONT_CACHE_KEY: &str = "snapframe:font-embed-css";

/// One `src` alternative of a font face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FontSource {
    Local(String),
    Url { url: String, format: Option<String> },
}

/// A parsed `@font-face` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontFace {
    /// Normalized (unquoted, lowercase) family name.
    pub family: String,
    pub display_family: String,
    pub sources: Vec<FontSource>,
    /// Every other descriptor (weight, style, unicode-range, ...), verbatim.
    pub descriptors: Vec<(String, String)>,
}

impl FontFace {
    pub fn to_css(&self) -> String {
        let mut css = format!("@font-face{{font-family:\"{}\";", self.display_family);
        let sources: Vec<String> = self
            .sources
            .iter()
            .map(|s| match s {
                FontSource::Local(name) => format!("local(\"{}\")", name),
                FontSource::Url { url, format: Some(f) } => format!("url(\"{}\") format(\"{}\")", url, f),
                FontSource::Url { url, format: None } => format!("url(\"{}\")", url),
            })
            .collect();
        if !sources.is_empty() {
            css.push_str(&format!("src:{};", sources.join(",")));
        }
        for (k, v) in &self.descriptors {
            css.push_str(&format!("{}:{};", k, v));
        }
        css.push('}');
        css
    }
}

/// Split on `sep` outside parentheses and quotes.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let (mut depth, mut quote, mut start) = (0i32, None::<char>, 0);
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, c) if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

fn function_arg<'a>(item: &'a str, name: &str) -> Option<&'a str> {
    let start = item.find(&format!("{}(", name))? + name.len() + 1;
    let end = start + item[start..].find(')')?;
    Some(unquote(&item[start..end]))
}

fn parse_source(item: &str) -> Option<FontSource> {
    let item = item.trim();
    if item.starts_with("local(") {
        return function_arg(item, "local").map(|n| FontSource::Local(n.to_string()));
    }
    let url = function_arg(item, "url")?;
    Some(FontSource::Url {
        url: url.to_string(),
        format: function_arg(item, "format").map(str::to_string),
    })
}

/// Every `@font-face` rule in `css`. Unbalanced braces are an error.
pub fn parse_font_faces(css: &str) -> Result<Vec<FontFace>> {
    let mut faces = Vec::new();
    let mut rest = css;
    while let Some(at) = rest.find("@font-face") {
        let after = &rest[at + "@font-face".len()..];
        let open = after
            .find('{')
            .ok_or_else(|| Error::FontError("@font-face without a body".into()))?;
        let close = after[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or_else(|| Error::FontError("unterminated @font-face rule".into()))?;
        let body = &after[open + 1..close];
        rest = &after[close + 1..];

        let mut face = FontFace {
            family: String::new(),
            display_family: String::new(),
            sources: Vec::new(),
            descriptors: Vec::new(),
        };
        for decl in split_top_level(body, ';') {
            let Some((prop, value)) = decl.split_once(':') else {
                continue;
            };
            let prop = prop.trim().to_ascii_lowercase();
            match prop.as_str() {
                "font-family" => {
                    face.display_family = unquote(value).to_string();
                    face.family = face.display_family.to_ascii_lowercase();
                }
                "src" => face.sources = split_top_level(value, ',').into_iter().filter_map(parse_source).collect(),
                _ => face.descriptors.push((prop, value.trim().to_string())),
            }
        }
        if !face.family.is_empty() {
            faces.push(face);
        }
    }
    Ok(faces)
}

/// Lowercase family names declared by `@font-face` rules in `css`.
pub fn embedded_families(css: &str) -> BTreeSet<String> {
    parse_font_faces(css)
        .map(|faces| faces.into_iter().map(|f| f.family).collect())
        .unwrap_or_default()
}

pub struct FontEmbedder<'a> {
    doc: &'a Document,
    cache: &'a ResourceCache,
    fetcher: &'a dyn Fetch,
}

impl<'a> FontEmbedder<'a> {
    pub fn new(doc: &'a Document, cache: &'a ResourceCache, fetcher: &'a dyn Fetch) -> Self {
        FontEmbedder { doc, cache, fetcher }
    }

    /// Embedded font CSS for `root`. Never fails: on error the result is
    /// empty and nothing is cached.
    pub async fn embed_css(&self, root: NodeId) -> String {
        if let Some(CachedResource::Binary { bytes, .. }) = self.cache.get(FONT_CACHE_KEY) {
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        match self.generate(root).await {
            Ok(css) => {
                self.cache.put(FONT_CACHE_KEY, CachedResource::binary(css.as_bytes().to_vec(), "text/css"));
                css
            }
            Err(e) => {
                warn!("font embedding failed, continuing without embedded fonts: {}", e);
                String::new()
            }
        }
    }

    async fn generate(&self, root: NodeId) -> Result<String> {
        let families = self.doc.applied_font_families(root);
        let mut faces = Vec::new();
        for sheet in self.doc.stylesheets() {
            faces.extend(parse_font_faces(&sheet)?.into_iter().filter(|f| families.contains(&f.family)));
        }
        let wanted = faces.len();

        let mut css = String::new();
        for mut face in faces {
            let mut sources = Vec::new();
            for source in std::mem::take(&mut face.sources) {
                let FontSource::Url { url, format } = source else {
                    continue;
                };
                match self.embed_source(&url).await {
                    Ok(data_url) => sources.push(FontSource::Url { url: data_url, format }),
                    Err(e) => warn!("dropping font source {} for {}: {}", url, face.family, e),
                }
            }
            if sources.is_empty() {
                warn!("no embeddable source left for font family {}", face.family);
                continue;
            }
            face.sources = sources;
            css.push_str(&face.to_css());
        }
        if wanted > 0 && css.is_empty() {
            return Err(Error::FontError(format!("none of {} font faces could be embedded", wanted)));
        }
        debug!("embedded font css: {} bytes for {:?}", css.len(), families);
        Ok(css)
    }

    async fn embed_source(&self, url: &str) -> Result<String> {
        if url.starts_with("data:") {
            return Ok(url.to_string());
        }
        let resolved = self
            .doc
            .origin()
            .join(url)
            .map_err(|e| Error::FontError(format!("bad font url {:?}: {}", url, e)))?;
        let fetched = self.fetcher.fetch(resolved.as_str()).await?;
        let content_type = if fetched.content_type.is_empty() {
            "font/woff2"
        } else {
            fetched.content_type.as_str()
        };
        Ok(format!("data:{};base64,{}", content_type, STANDARD.encode(&fetched.bytes)))
    }
}

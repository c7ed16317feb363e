//! Block layout over a document subtree.
//!
//! Elements stack vertically unless they are `display: flex` rows, in which
//! case children share the row width equally. Text wraps on word boundaries
//! in fixed 8px glyph cells.

use crate::dom::{Document, NodeFilter, NodeId};

/// Width of one glyph cell in CSS pixels.
pub const CELL: u32 = 8;
pub const LINE_HEIGHT: u32 = 10;

const SKIPPED_TAGS: &[&str] = &["head", "style", "script", "title", "meta", "link", "template"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoxKind {
    Block,
    Image {
        src: String,
        cover: bool,
    },
    Text {
        lines: Vec<String>,
        color: Option<String>,
        family: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutBox {
    pub node: NodeId,
    pub rect: Rect,
    pub kind: BoxKind,
    pub background: Option<String>,
}

/// Boxes in paint order plus the overall extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub boxes: Vec<LayoutBox>,
    pub width: u32,
    pub height: u32,
}

/// Lay out `root` and everything below it that `filter` keeps.
///
/// The root's own `width` wins over `viewport_width` when it is a pixel
/// length; that is how the capture width normalization takes effect.
pub fn layout_subtree(doc: &Document, root: NodeId, filter: NodeFilter, viewport_width: u32) -> Layout {
    let width = length(doc.style(root, "width").as_deref(), Some(viewport_width))
        .unwrap_or(viewport_width)
        .max(1);
    let mut boxes = Vec::new();
    let height = place(doc, root, filter, (0, 0), width, None, &mut boxes);
    Layout {
        boxes,
        width,
        height: height.max(1),
    }
}

fn place(
    doc: &Document,
    node: NodeId,
    filter: NodeFilter,
    (x, y): (i32, i32),
    avail: u32,
    parent_height: Option<u32>,
    out: &mut Vec<LayoutBox>,
) -> u32 {
    if !filter(doc, node) {
        return 0;
    }
    if let Some(text) = doc.text(node) {
        let lines = wrap(&text, avail);
        if lines.is_empty() {
            return 0;
        }
        let height = lines.len() as u32 * LINE_HEIGHT;
        out.push(LayoutBox {
            node,
            rect: Rect { x, y, width: avail, height },
            kind: BoxKind::Text {
                lines,
                color: doc.inherited_style(node, "color"),
                family: doc.inherited_style(node, "font-family"),
            },
            background: None,
        });
        return height;
    }
    let Some(tag) = doc.tag(node) else {
        return 0;
    };
    if SKIPPED_TAGS.contains(&tag.as_str()) || doc.is_hidden(node) {
        return 0;
    }

    let padding = length(doc.style(node, "padding").as_deref(), Some(avail)).unwrap_or(0);
    let width = length(doc.style(node, "width").as_deref(), Some(avail))
        .or_else(|| attr_px(doc, node, "width"))
        .unwrap_or(avail)
        .min(avail);
    let explicit_height = length(doc.style(node, "height").as_deref(), parent_height)
        .or_else(|| attr_px(doc, node, "height"));
    let background = doc
        .style(node, "background-color")
        .or_else(|| doc.style(node, "background"));

    if tag == "img" {
        let height = explicit_height.unwrap_or(width);
        out.push(LayoutBox {
            node,
            rect: Rect { x, y, width, height },
            kind: BoxKind::Image {
                src: doc.attr(node, "src").unwrap_or_default(),
                cover: doc.style(node, "object-fit").as_deref() == Some("cover"),
            },
            background,
        });
        return height;
    }

    let index = out.len();
    out.push(LayoutBox {
        node,
        rect: Rect::default(),
        kind: BoxKind::Block,
        background,
    });

    let inner_width = width.saturating_sub(padding * 2);
    let inner_height = explicit_height.map(|h| h.saturating_sub(padding * 2));
    let origin = (x + padding as i32, y + padding as i32);
    let children = doc.children(node);
    let content_height = if is_row(doc, node) && !children.is_empty() {
        let share = inner_width / children.len() as u32;
        let mut cx = origin.0;
        let mut tallest = 0;
        for child in children {
            tallest = tallest.max(place(doc, child, filter, (cx, origin.1), share, inner_height, out));
            cx += share as i32;
        }
        tallest
    } else {
        let mut used = 0;
        for child in children {
            used += place(doc, child, filter, (origin.0, origin.1 + used as i32), inner_width, inner_height, out);
        }
        used
    };

    let height = explicit_height.unwrap_or(content_height + padding * 2);
    out[index].rect = Rect { x, y, width, height };
    height
}

fn is_row(doc: &Document, node: NodeId) -> bool {
    doc.style(node, "display").as_deref() == Some("flex")
        && !doc
            .style(node, "flex-direction")
            .map(|d| d.starts_with("column"))
            .unwrap_or(false)
}

/// Resolve a CSS length in `px` or `%` (of `relative_to`).
pub fn length(value: Option<&str>, relative_to: Option<u32>) -> Option<u32> {
    let v = value?.trim();
    if let Some(px) = v.strip_suffix("px") {
        return px.trim().parse::<f32>().ok().map(|n| n.max(0.0).round() as u32);
    }
    if let Some(pct) = v.strip_suffix('%') {
        let base = relative_to?;
        return pct
            .trim()
            .parse::<f32>()
            .ok()
            .map(|n| (base as f32 * n.max(0.0) / 100.0).round() as u32);
    }
    if v == "0" {
        return Some(0);
    }
    None
}

fn attr_px(doc: &Document, node: NodeId, name: &str) -> Option<u32> {
    doc.attr(node, name).and_then(|v| v.trim().parse::<u32>().ok())
}

/// Greedy word wrap into lines of at most `width / CELL` characters.
pub fn wrap(text: &str, width: u32) -> Vec<String> {
    let chars_per_line = (width / CELL).max(1) as usize;
    let mut lines = Vec::new();
    let mut cur = String::new();
    for word in text.split_whitespace() {
        if !cur.is_empty() && cur.chars().count() + word.chars().count() + 1 > chars_per_line {
            lines.push(std::mem::take(&mut cur));
        }
        if !cur.is_empty() {
            cur.push(' ');
        }
        cur.push_str(word);
    }
    if !cur.is_empty() {
        lines.push(cur);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep_all(_: &Document, _: NodeId) -> bool {
        true
    }

    fn skip_video(doc: &Document, node: NodeId) -> bool {
        !doc.is_tag(node, "video")
    }

    #[test]
    fn blocks_stack_and_text_wraps() {
        let doc = Document::new("https://recap.example").unwrap();
        let root = doc.create_element("section");
        doc.set_style(root, "width", "72px");
        let a = doc.create_element("div");
        doc.set_style(a, "height", "20px");
        let p = doc.create_element("p");
        let t = doc.create_text("hello wide world");
        doc.append_child(doc.body(), root).unwrap();
        doc.append_child(root, a).unwrap();
        doc.append_child(root, p).unwrap();
        doc.append_child(p, t).unwrap();

        let layout = layout_subtree(&doc, root, keep_all, 1024);
        assert_eq!(layout.width, 72);
        let text = layout.boxes.iter().find(|b| b.node == t).unwrap();
        assert_eq!(text.rect.y, 20);
        match &text.kind {
            BoxKind::Text { lines, .. } => assert_eq!(lines, &vec!["hello".to_string(), "wide".into(), "world".into()]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(layout.height, 20 + 3 * LINE_HEIGHT);
    }

    #[test]
    fn flex_rows_share_width_and_filter_drops_nodes() {
        let doc = Document::new("https://recap.example").unwrap();
        let row = doc.create_element("div");
        doc.set_style(row, "display", "flex");
        doc.set_style(row, "width", "100px");
        doc.set_style(row, "height", "40px");
        let img = doc.create_element("img");
        doc.set_style(img, "height", "100%");
        let video = doc.create_element("video");
        doc.append_child(doc.body(), row).unwrap();
        doc.append_child(row, img).unwrap();
        doc.append_child(row, video).unwrap();

        let layout = layout_subtree(&doc, row, skip_video, 1024);
        let img_box = layout.boxes.iter().find(|b| b.node == img).unwrap();
        assert_eq!(img_box.rect, Rect { x: 0, y: 0, width: 50, height: 40 });
        assert!(layout.boxes.iter().all(|b| b.node != video));
    }

    #[test]
    fn lengths() {
        assert_eq!(length(Some("12px"), None), Some(12));
        assert_eq!(length(Some("50%"), Some(30)), Some(15));
        assert_eq!(length(Some("50%"), None), None);
        assert_eq!(length(Some("auto"), Some(10)), None);
    }
}

//! Build a [`Document`] from HTML markup.

use super::{parse_inline_style, Document, NodeId};
use crate::Result;
use scraper::{ElementRef, Html, Node};

/// Parse `html` into a document served from `origin`.
///
/// `<html>`, `<head>` and `<body>` map onto the document's own skeleton.
/// The `style` attribute is split into inline style properties and the text
/// of every `<style>` element is registered as a stylesheet.
pub fn parse_document(html: &str, origin: &str) -> Result<Document> {
    let doc = Document::new(origin)?;
    let parsed = Html::parse_document(html);

    let root = parsed.root_element();
    let mut stack: Vec<(ElementRef, NodeId)> = vec![(root, doc.root())];
    while let Some((element, target)) = stack.pop() {
        let mut pending = Vec::new();
        for child in element.children() {
            match child.value() {
                Node::Element(el) => {
                    let Some(child_ref) = ElementRef::wrap(child) else {
                        continue;
                    };
                    let tag = el.name().to_ascii_lowercase();
                    let node = match tag.as_str() {
                        "head" => doc.head(),
                        "body" => doc.body(),
                        _ => {
                            let node = doc.create_element(&tag);
                            doc.append_child(target, node)?;
                            node
                        }
                    };
                    for (name, value) in el.attrs() {
                        if name == "style" {
                            for (prop, v) in parse_inline_style(value) {
                                doc.set_style(node, &prop, &v);
                            }
                        } else {
                            doc.set_attr(node, name, value);
                        }
                    }
                    if tag == "style" {
                        doc.add_stylesheet(&child_ref.text().collect::<String>());
                    }
                    pending.push((child_ref, node));
                }
                Node::Text(text) => {
                    if !text.trim().is_empty() {
                        let node = doc.create_text(text);
                        doc.append_child(target, node)?;
                    }
                }
                _ => {}
            }
        }
        // Reverse so the stack pops siblings in document order.
        for entry in pending.into_iter().rev() {
            stack.push(entry);
        }
    }

    Ok(doc)
}

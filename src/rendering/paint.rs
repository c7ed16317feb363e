//! Display list built from a layout.

use super::layout::{BoxKind, Layout, LINE_HEIGHT};
use crate::dom::split_font_families;
use std::collections::BTreeSet;

const DEFAULT_TEXT: [u8; 4] = [0, 0, 0, 255];

#[derive(Debug, Clone, PartialEq)]
pub enum PaintCommand {
    SolidRect {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        rgba: [u8; 4],
    },
    Image {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        src: String,
        cover: bool,
    },
    /// One line of text. `solid` glyphs mean the face was embedded; the
    /// fallback face is drawn as outlines.
    Text {
        x: i32,
        y: i32,
        text: String,
        rgba: [u8; 4],
        solid: bool,
    },
}

/// Paint commands for `layout` over a `background` fill. `embedded` holds
/// the lowercase family names that have an embedded face.
pub fn display_list(layout: &Layout, background: &str, embedded: &BTreeSet<String>) -> Vec<PaintCommand> {
    let mut cmds = Vec::with_capacity(layout.boxes.len() + 1);
    if let Some(rgba) = parse_color(background) {
        cmds.push(PaintCommand::SolidRect {
            x: 0,
            y: 0,
            width: layout.width,
            height: layout.height,
            rgba,
        });
    }
    for b in &layout.boxes {
        let r = b.rect;
        if let Some(rgba) = b.background.as_deref().and_then(parse_color) {
            cmds.push(PaintCommand::SolidRect {
                x: r.x,
                y: r.y,
                width: r.width,
                height: r.height,
                rgba,
            });
        }
        match &b.kind {
            BoxKind::Block => {}
            BoxKind::Image { src, cover } => cmds.push(PaintCommand::Image {
                x: r.x,
                y: r.y,
                width: r.width,
                height: r.height,
                src: src.clone(),
                cover: *cover,
            }),
            BoxKind::Text { lines, color, family } => {
                let rgba = color.as_deref().and_then(parse_color).unwrap_or(DEFAULT_TEXT);
                let solid = family
                    .as_deref()
                    .map(|f| split_font_families(f).iter().any(|name| embedded.contains(name)))
                    .unwrap_or(false);
                for (i, line) in lines.iter().enumerate() {
                    cmds.push(PaintCommand::Text {
                        x: r.x,
                        y: r.y + (i as u32 * LINE_HEIGHT) as i32,
                        text: line.clone(),
                        rgba,
                        solid,
                    });
                }
            }
        }
    }
    cmds
}

/// Parse `#rgb`, `#rrggbb`, `#rrggbbaa`, `rgb()`, `rgba()` and a few names.
pub fn parse_color(value: &str) -> Option<[u8; 4]> {
    let v = value.trim().to_ascii_lowercase();
    if let Some(hex) = v.strip_prefix('#') {
        let byte = |s: &str| u8::from_str_radix(s, 16).ok();
        return match hex.len() {
            3 => {
                let mut out = [255u8; 4];
                for (i, c) in hex.chars().enumerate() {
                    let d = c.to_digit(16)? as u8;
                    out[i] = d * 17;
                }
                Some(out)
            }
            6 => Some([byte(&hex[0..2])?, byte(&hex[2..4])?, byte(&hex[4..6])?, 255]),
            8 => Some([byte(&hex[0..2])?, byte(&hex[2..4])?, byte(&hex[4..6])?, byte(&hex[6..8])?]),
            _ => None,
        };
    }
    if let Some(args) = v
        .strip_prefix("rgba(")
        .or_else(|| v.strip_prefix("rgb("))
        .and_then(|s| s.strip_suffix(')'))
    {
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            return None;
        }
        let channel = |s: &str| s.parse::<f32>().ok().map(|n| n.clamp(0.0, 255.0).round() as u8);
        let alpha = match parts.get(3) {
            Some(a) => (a.parse::<f32>().ok()?.clamp(0.0, 1.0) * 255.0).round() as u8,
            None => 255,
        };
        return Some([channel(parts[0])?, channel(parts[1])?, channel(parts[2])?, alpha]);
    }
    match v.as_str() {
        "white" => Some([255, 255, 255, 255]),
        "black" => Some([0, 0, 0, 255]),
        "red" => Some([255, 0, 0, 255]),
        "green" => Some([0, 128, 0, 255]),
        "blue" => Some([0, 0, 255, 255]),
        "gray" | "grey" => Some([128, 128, 128, 255]),
        "transparent" => Some([0, 0, 0, 0]),
        _ => None,
    }
}

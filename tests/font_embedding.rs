use snapframe::capture::{Capturer, SaveOptions};
use snapframe::fetch::{Fetched, StaticFetcher};
use snapframe::fonts::FONT_CACHE_KEY;
use snapframe::platform::{Capabilities, HeadlessPlatform};
use snapframe::rendering::raster::decode_png;
use snapframe::rendering::strategy::FONT_STYLE_MARKER;
use snapframe::{CachedResource, CaptureConfig, CaptureStatus, Document, NodeId};
use std::sync::Arc;

const ORIGIN: &str = "https://recap.example";
const FONT_URL: &str = "https://recap.example/fonts/pretendard.woff2";
const SHEET: &str = r#"
    @font-face {
        font-family: "Pretendard";
        font-weight: 700;
        src: local("Pretendard Bold"), url("/fonts/pretendard.woff2") format("woff2");
    }
"#;
const INK: [u8; 4] = [0, 0, 0, 255];
const PAPER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

fn page() -> (Document, NodeId) {
    let doc = Document::new(ORIGIN).unwrap();
    doc.add_stylesheet(SHEET);
    let root = doc.create_element("div");
    doc.set_style(root, "font-family", "'Pretendard', sans-serif");
    doc.set_style(root, "color", "#000000");
    let text = doc.create_text("W");
    doc.append_child(root, text).unwrap();
    doc.append_child(doc.body(), root).unwrap();
    (doc, root)
}

fn config() -> CaptureConfig {
    CaptureConfig {
        pixel_ratio: 1.0,
        min_capture_width: 40,
        background_color: "#ffffff".into(),
        ..CaptureConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn embedded_face_renders_solid_and_is_fetched_once() {
    let (doc, root) = page();
    let fetcher = Arc::new(StaticFetcher::new().route(FONT_URL, Fetched::new(b"wOF2\0\0".to_vec(), "font/woff2")));
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(doc, platform.clone(), fetcher.clone(), config()).unwrap();

    for name in ["a.png", "b.png"] {
        let status = capturer.save_as_image(root, SaveOptions::new(name)).await;
        assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    }
    assert_eq!(fetcher.hits(FONT_URL), 1);
    match capturer.cache().get(FONT_CACHE_KEY) {
        Some(CachedResource::Binary { bytes, .. }) => {
            let css = String::from_utf8(bytes.to_vec()).unwrap();
            assert!(css.contains("data:font/woff2;base64,"));
            assert!(!css.contains("local("));
        }
        other => panic!("font css not cached: {:?}", other),
    }

    let image = decode_png(&platform.downloads()[0].bytes).unwrap();
    assert_eq!((image.width, image.height), (40, 10));
    assert_eq!(image.pixel(3, 4), Some(INK));
}

#[tokio::test(start_paused = true)]
async fn missing_font_falls_back_without_caching() {
    let (doc, root) = page();
    let fetcher = Arc::new(StaticFetcher::new());
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(doc, platform.clone(), fetcher.clone(), config()).unwrap();

    for name in ["a.png", "b.png"] {
        let status = capturer.save_as_image(root, SaveOptions::new(name)).await;
        assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    }
    // A failed embedding is retried on the next export.
    assert_eq!(fetcher.hits(FONT_URL), 2);
    assert!(capturer.cache().get(FONT_CACHE_KEY).is_none());
    assert!(platform.notices().is_empty());

    // Outlined fallback glyph: ink on the edge, paper inside.
    let image = decode_png(&platform.downloads()[1].bytes).unwrap();
    assert_eq!(image.pixel(1, 1), Some(INK));
    assert_eq!(image.pixel(3, 4), Some(PAPER));
}

#[tokio::test(start_paused = true)]
async fn webkit_exports_through_a_clone() {
    let (doc, root) = page();
    let fetcher = Arc::new(StaticFetcher::new().route(FONT_URL, Fetched::new(b"wOF2\0\0".to_vec(), "font/woff2")));
    let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/119.0 Mobile/15E148 Safari/604.1";
    let platform = Arc::new(HeadlessPlatform::new().with_capabilities(Capabilities::from_user_agent(ua)));
    let capturer = Capturer::new(doc.clone(), platform.clone(), fetcher, config()).unwrap();

    let status = capturer.save_as_image(root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    let image = decode_png(&platform.downloads()[0].bytes).unwrap();
    assert_eq!(image.pixel(3, 4), Some(INK));

    // The font style went into the clone only.
    assert_eq!(doc.stylesheets().len(), 1);
    assert!(doc.query_selector(&format!("[{}]", FONT_STYLE_MARKER)).is_none());
}

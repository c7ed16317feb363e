use async_trait::async_trait;
use snapframe::capture::{hook, Capturer, SaveOptions, CAPTURE_ROOT_MARKER, FAILURE_NOTICE};
use snapframe::fetch::{Fetch, Fetched, HttpFetcher, StaticFetcher};
use snapframe::freeze::{PLACEHOLDER_MARKER, VIDEO_PLACEHOLDER_COLOR};
use snapframe::handles::HandleRegistry;
use snapframe::platform::{HeadlessPlatform, ReadyState, SimulatedVideo};
use snapframe::rendering::images::PLACEHOLDER_RGBA;
use snapframe::rendering::raster::{decode_png, encode_png, Bitmap};
use snapframe::rendering::strategy::CloneCanvas;
use snapframe::rendering::{RasterOutput, RasterRequest, RasterStrategy, StrategyKind, TieredRasterizer};
use snapframe::{CaptureConfig, CaptureStatus, Document, Error, NodeId, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiny_http::{Response, Server};

const AVATAR: &str = "https://cdn.example/avatar.png";
const RED: [u8; 4] = [220, 30, 40, 255];
const DARK: [u8; 4] = [0x1a, 0x1a, 0x1a, 0xff];

fn png(rgba: [u8; 4]) -> Vec<u8> {
    let bitmap = Bitmap::solid(4, 4, rgba);
    encode_png(4, 4, &bitmap.rgba).unwrap()
}

fn jpeg(rgb: [u8; 3]) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 8, image::Rgb(rgb)));
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .unwrap();
    bytes
}

fn close_to(px: Option<[u8; 4]>, want: [u8; 4]) -> bool {
    px.map(|px| px.iter().zip(want).all(|(a, b)| a.abs_diff(b) <= 4))
        .unwrap_or(false)
}

fn config() -> CaptureConfig {
    CaptureConfig {
        pixel_ratio: 1.0,
        min_capture_width: 40,
        font_wait_ms: 200,
        image_wait_ms: 500,
        ..CaptureConfig::default()
    }
}

struct Panel {
    doc: Document,
    root: NodeId,
    avatars: Vec<NodeId>,
    video: NodeId,
}

/// A 40x20 panel: one flex row holding `avatars` copies of the cross-origin
/// avatar and a tile with a video that has not decoded a frame yet.
fn panel(origin: &str, avatars: usize) -> Panel {
    let doc = Document::new(origin).unwrap();
    let root = doc.create_element("section");
    doc.set_attr(root, "id", "recap");
    doc.append_child(doc.body(), root).unwrap();

    let row = doc.create_element("div");
    doc.set_style(row, "display", "flex");
    doc.set_style(row, "height", "20px");
    doc.append_child(root, row).unwrap();

    let mut imgs = Vec::new();
    for _ in 0..avatars {
        let img = doc.create_element("img");
        doc.set_attr(img, "src", AVATAR);
        doc.set_attr(img, "srcset", "https://cdn.example/avatar@2x.png 2x");
        doc.set_style(img, "height", "100%");
        doc.append_child(row, img).unwrap();
        imgs.push(img);
    }

    let tile = doc.create_element("div");
    doc.set_style(tile, "height", "100%");
    doc.append_child(row, tile).unwrap();
    let video = doc.create_element("video");
    doc.set_attr(video, "class", "tier-video");
    doc.append_child(tile, video).unwrap();
    doc.attach_media(video, Arc::new(SimulatedVideo::new().with_ready_state(ReadyState::HaveMetadata)));

    Panel {
        doc,
        root,
        avatars: imgs,
        video,
    }
}

fn assert_restored(panel: &Panel) {
    let doc = &panel.doc;
    for img in &panel.avatars {
        assert_eq!(doc.attr(*img, "src").as_deref(), Some(AVATAR));
        assert_eq!(
            doc.attr(*img, "srcset").as_deref(),
            Some("https://cdn.example/avatar@2x.png 2x")
        );
        assert_eq!(doc.attr(*img, "loading"), None);
    }
    assert_eq!(doc.style(panel.video, "display"), None);
    assert!(doc.query_selector(&format!("[{}]", PLACEHOLDER_MARKER)).is_none());
    assert_eq!(doc.attr(panel.root, CAPTURE_ROOT_MARKER), None);
    assert_eq!(doc.style(panel.root, "width"), None);
    assert!(!doc.is_scroll_locked());
}

/// Serve `/api/image-proxy?url=<AVATAR>` on a loopback port, counting hits.
fn spawn_relay(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let origin = format!("http://{}", server.server_addr());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let url = url::Url::parse(&format!("http://relay{}", request.url())).unwrap();
            let upstream = url
                .query_pairs()
                .find(|(k, _)| k == "url")
                .map(|(_, v)| v.into_owned());
            if url.path() == "/api/image-proxy" && upstream.as_deref() == Some(AVATAR) {
                counter.fetch_add(1, Ordering::SeqCst);
                let response = Response::from_data(body.clone())
                    .with_header("Content-Type: image/png".parse::<tiny_http::Header>().unwrap());
                let _ = request.respond(response);
            } else {
                let _ = request.respond(Response::from_string("not found").with_status_code(404));
            }
        }
    });
    (origin, hits)
}

fn relay_route(origin: &str) -> String {
    format!("{}/api/image-proxy?url=https%3A%2F%2Fcdn.example%2Favatar.png", origin)
}

#[tokio::test]
async fn exports_relayed_image_and_video_placeholder() {
    let (origin, hits) = spawn_relay(png(RED));
    let panel = panel(&origin, 1);
    let platform = Arc::new(HeadlessPlatform::new());
    let fetcher = Arc::new(HttpFetcher::new(&config()).unwrap());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher, config()).unwrap();

    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { ref file_name, .. } if file_name == "recap.png"));

    let downloads = platform.downloads();
    assert_eq!(downloads.len(), 1);
    let image = decode_png(&downloads[0].bytes).unwrap();
    assert_eq!((image.width, image.height), (40, 20));
    assert_eq!(image.pixel(5, 10), Some(RED));
    assert_eq!(image.pixel(30, 10), Some(DARK));
    assert_eq!(VIDEO_PLACEHOLDER_COLOR, "#1a1a1a");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(platform.notices().is_empty());
    assert_restored(&panel);
}

#[tokio::test(start_paused = true)]
async fn repeated_sources_are_relayed_once() {
    let origin = "https://recap.example";
    let fetcher = Arc::new(StaticFetcher::new().route(&relay_route(origin), Fetched::new(png(RED), "image/png")));
    let panel = panel(origin, 2);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher.clone(), config()).unwrap();

    for name in ["first.png", "second.png"] {
        let status = capturer.save_as_image(panel.root, SaveOptions::new(name)).await;
        assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    }
    assert_eq!(fetcher.hits(&relay_route(origin)), 1);
    assert_eq!(platform.downloads().len(), 2);

    capturer.clear_cache();
    capturer.save_as_image(panel.root, SaveOptions::new("third.png")).await;
    assert_eq!(fetcher.hits(&relay_route(origin)), 2);
    assert_restored(&panel);
}

#[tokio::test(start_paused = true)]
async fn relay_failure_degrades_to_placeholder() {
    let panel = panel("https://recap.example", 1);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(
        panel.doc.clone(),
        platform.clone(),
        Arc::new(StaticFetcher::new()),
        config(),
    )
    .unwrap();

    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    let image = decode_png(&platform.downloads()[0].bytes).unwrap();
    assert_eq!(image.pixel(5, 10), Some(PLACEHOLDER_RGBA));
    assert!(platform.notices().is_empty());
    assert_restored(&panel);
}

struct Failing(StrategyKind);

#[async_trait]
impl RasterStrategy for Failing {
    fn kind(&self) -> StrategyKind {
        self.0
    }

    async fn rasterize(&self, _: &RasterRequest<'_>) -> Result<RasterOutput> {
        Err(Error::RenderError(format!("{:?} is broken here", self.0)))
    }
}

#[tokio::test(start_paused = true)]
async fn falls_back_when_primary_strategy_fails() {
    let origin = "https://recap.example";
    let fetcher = Arc::new(StaticFetcher::new().route(&relay_route(origin), Fetched::new(png(RED), "image/png")));
    let panel = panel(origin, 1);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher, config())
        .unwrap()
        .with_rasterizer(TieredRasterizer::with_strategies(vec![
            Box::new(Failing(StrategyKind::DomToImage)),
            Box::new(CloneCanvas),
        ]));

    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    let image = decode_png(&platform.downloads()[0].bytes).unwrap();
    assert_eq!(image.pixel(5, 10), Some(RED));
    assert!(platform.notices().is_empty());
    assert_restored(&panel);
}

/// Records how many handles were live while rendering, then fails.
struct Recorder {
    seen: Arc<Mutex<Option<(usize, Arc<HandleRegistry>)>>>,
}

#[async_trait]
impl RasterStrategy for Recorder {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DomToImage
    }

    async fn rasterize(&self, request: &RasterRequest<'_>) -> Result<RasterOutput> {
        let handles = request.loader.handles();
        *self.seen.lock().unwrap() = Some((handles.live_count(), handles.clone()));
        Err(Error::RenderError("recorded".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn total_failure_notifies_once_and_cleans_up() {
    let origin = "https://recap.example";
    let fetcher = Arc::new(StaticFetcher::new().route(&relay_route(origin), Fetched::new(png(RED), "image/png")));
    let panel = panel(origin, 1);
    let platform = Arc::new(HeadlessPlatform::new());
    let seen = Arc::new(Mutex::new(None));
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher, config())
        .unwrap()
        .with_rasterizer(TieredRasterizer::with_strategies(vec![
            Box::new(Recorder { seen: seen.clone() }),
            Box::new(Failing(StrategyKind::CloneCanvas)),
        ]));

    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Failed(ref m) if m.contains("all raster strategies failed")));
    assert_eq!(platform.notices(), vec![FAILURE_NOTICE.to_string()]);
    assert!(platform.downloads().is_empty());

    let (live_during, handles) = seen.lock().unwrap().take().unwrap();
    assert_eq!(live_during, 1);
    assert_eq!(handles.live_count(), 0);
    assert!(!capturer.is_saving());
    assert_restored(&panel);
}

#[tokio::test(start_paused = true)]
async fn concurrent_call_is_ignored() {
    let origin = "https://recap.example";
    let fetcher = Arc::new(
        StaticFetcher::new()
            .with_latency(Duration::from_millis(80))
            .route(&relay_route(origin), Fetched::new(png(RED), "image/png")),
    );
    let panel = panel(origin, 1);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher, config()).unwrap();

    let (first, second) = tokio::join!(
        capturer.save_as_image(panel.root, SaveOptions::new("first.png")),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(capturer.is_saving());
            capturer.save_as_image(panel.root, SaveOptions::new("second.png")).await
        }
    );
    assert!(matches!(first, CaptureStatus::Saved { .. }), "{:?}", first);
    assert_eq!(second, CaptureStatus::Skipped);
    let downloads = platform.downloads();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].file_name, "first.png");
    assert_restored(&panel);

    let again = capturer.save_as_image(panel.root, SaveOptions::new("again.png")).await;
    assert!(matches!(again, CaptureStatus::Saved { .. }));
}

#[tokio::test(start_paused = true)]
async fn hooks_bracket_the_substituted_content() {
    let origin = "https://recap.example";
    let fetcher = Arc::new(StaticFetcher::new().route(&relay_route(origin), Fetched::new(png(RED), "image/png")));
    let panel = panel(origin, 1);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher, config()).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let img = panel.avatars[0];
    let before = {
        let log = log.clone();
        hook(move |doc: Document| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("before:{}", doc.attr(img, "src").unwrap_or_default()));
                Ok(())
            }
        })
    };
    let after = {
        let log = log.clone();
        hook(move |doc: Document| {
            let log = log.clone();
            async move {
                let locked = doc.is_scroll_locked();
                log.lock()
                    .unwrap()
                    .push(format!("after:{}:{}", doc.attr(img, "src").unwrap_or_default(), locked));
                Ok(())
            }
        })
    };

    let options = SaveOptions::new("recap.png").before_capture(before).after_capture(after);
    let status = capturer.save_as_image(panel.root, options).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }));
    // The after hook sees original content while the page is still locked.
    assert_eq!(
        *log.lock().unwrap(),
        vec![format!("before:{}", AVATAR), format!("after:{}:true", AVATAR)]
    );
    assert_restored(&panel);
}

#[cfg(feature = "html")]
#[tokio::test(start_paused = true)]
async fn exports_parsed_markup() {
    let origin = "https://recap.example";
    let markup = r#"<html><body>
        <section id="recap" style="padding: 0px">
          <div style="display: flex; height: 20px">
            <img src="/_next/image?url=https%3A%2F%2Fcdn.example%2Favatar.png&w=64" style="height: 100%">
            <div style="height: 100%; background-color: #1a1a1a"></div>
          </div>
        </section>
    </body></html>"#;
    let doc = snapframe::dom::html::parse_document(markup, origin).unwrap();
    let root = doc.query_selector("#recap").unwrap();
    let fetcher = Arc::new(StaticFetcher::new().route(&relay_route(origin), Fetched::new(png(RED), "image/png")));
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(doc, platform.clone(), fetcher.clone(), config()).unwrap();

    let status = capturer.save_as_image(root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    assert_eq!(fetcher.hits(&relay_route(origin)), 1);
    let image = decode_png(&platform.downloads()[0].bytes).unwrap();
    assert_eq!(image.pixel(5, 10), Some(RED));
    assert_eq!(image.pixel(30, 10), Some(DARK));
}

#[tokio::test(start_paused = true)]
async fn relayed_jpeg_keeps_its_pixels() {
    let origin = "https://recap.example";
    let fetcher = Arc::new(
        StaticFetcher::new().route(&relay_route(origin), Fetched::new(jpeg([220, 30, 40]), "image/jpeg")),
    );
    let panel = panel(origin, 1);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher, config()).unwrap();

    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    let image = decode_png(&platform.downloads()[0].bytes).unwrap();
    assert!(close_to(image.pixel(5, 10), RED), "{:?}", image.pixel(5, 10));
    assert_restored(&panel);
}

const LOGO: &str = "https://recap.example/assets/logo.png";

fn with_logo(panel: &Panel) -> NodeId {
    let row = panel.doc.children(panel.root)[0];
    let logo = panel.doc.create_element("img");
    panel.doc.set_attr(logo, "src", "/assets/logo.png");
    panel.doc.set_style(logo, "height", "100%");
    panel.doc.append_child(row, logo).unwrap();
    logo
}

#[tokio::test(start_paused = true)]
async fn same_origin_images_are_cache_busted_without_handles() {
    let origin = "https://recap.example";
    let busted = format!("{}?cacheBust=1", LOGO);
    let fetcher = Arc::new(StaticFetcher::new().route(&busted, Fetched::new(png(RED), "image/png")));
    let panel = panel(origin, 0);
    with_logo(&panel);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher.clone(), config()).unwrap();

    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    assert_eq!(fetcher.hits(&busted), 1);
    assert_eq!(fetcher.hits(LOGO), 0);
}

#[tokio::test(start_paused = true)]
async fn handles_disable_cache_busting() {
    let origin = "https://recap.example";
    let fetcher = Arc::new(
        StaticFetcher::new()
            .route(&relay_route(origin), Fetched::new(png(RED), "image/png"))
            .route(LOGO, Fetched::new(png(RED), "image/png")),
    );
    let panel = panel(origin, 1);
    with_logo(&panel);
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher.clone(), config()).unwrap();

    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    assert_eq!(fetcher.hits(LOGO), 1);
    assert_eq!(fetcher.hits(&format!("{}?cacheBust=1", LOGO)), 0);
}

/// Delays every URL containing `slow` before answering from `inner`.
struct SlowFor {
    inner: StaticFetcher,
    slow: &'static str,
    delay: Duration,
}

#[async_trait]
impl Fetch for SlowFor {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        if url.contains(self.slow) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.fetch(url).await
    }
}

#[tokio::test(start_paused = true)]
async fn abandoned_export_still_restores_the_page() {
    let origin = "https://recap.example";
    let banner_route = format!("{}/api/image-proxy?url=https%3A%2F%2Fcdn.example%2Fbanner.png", origin);
    let fetcher = Arc::new(SlowFor {
        inner: StaticFetcher::new()
            .route(&relay_route(origin), Fetched::new(png(RED), "image/png"))
            .route(&banner_route, Fetched::new(png(RED), "image/png")),
        slow: "banner.png",
        delay: Duration::from_secs(2),
    });
    let panel = panel(origin, 1);
    let banner = panel.doc.create_element("img");
    panel.doc.set_attr(banner, "src", "https://cdn.example/banner.png");
    panel.doc.append_child(panel.root, banner).unwrap();
    let platform = Arc::new(HeadlessPlatform::new());
    let capturer = Capturer::new(panel.doc.clone(), platform.clone(), fetcher, config()).unwrap();

    // The avatar is rewritten right away; the banner is still in flight.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(300),
        capturer.save_as_image(panel.root, SaveOptions::new("recap.png")),
    )
    .await;
    assert!(abandoned.is_err());

    assert_restored(&panel);
    assert_eq!(panel.doc.attr(banner, "src").as_deref(), Some("https://cdn.example/banner.png"));
    assert_eq!(panel.doc.attr(banner, "loading"), None);
    assert!(!capturer.is_saving());
    assert!(platform.downloads().is_empty());

    // Nothing stale is left behind for the next export.
    let status = capturer.save_as_image(panel.root, SaveOptions::new("recap.png")).await;
    assert!(matches!(status, CaptureStatus::Saved { .. }), "{:?}", status);
    assert_restored(&panel);
}

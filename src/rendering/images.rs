//! Image resolution for rasterization: data URLs, temporary handles and
//! network sources, decoded once per export.

use super::raster::{decode_image, Bitmap};
use crate::dom::{Document, NodeId};
use crate::fetch::Fetch;
use crate::handles::HandleRegistry;
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::join_all;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

/// Colour of the neutral image placeholder (`#E5E8EB`).
pub const PLACEHOLDER_RGBA: [u8; 4] = [0xE5, 0xE8, 0xEB, 0xFF];

/// The neutral image placeholder as a bitmap.
pub fn placeholder_bitmap() -> Bitmap {
    Bitmap::solid(80, 80, PLACEHOLDER_RGBA)
}

/// Whether fetched sources may carry a cache-busting query: only when none
/// of them is a temporary handle.
pub fn allows_cache_bust<'a>(sources: impl IntoIterator<Item = &'a str>) -> bool {
    !sources.into_iter().any(HandleRegistry::is_handle)
}

pub fn cache_bust_url(src: &str, stamp: u64) -> String {
    let sep = if src.contains('?') { '&' } else { '?' };
    format!("{}{}cacheBust={}", src, sep, stamp)
}

/// Per-export image loader. Failed sources decode to the placeholder and
/// are not retried within the same export.
pub struct ImageLoader {
    origin: Url,
    fetcher: Option<Arc<dyn Fetch>>,
    handles: Arc<HandleRegistry>,
    decoded: Mutex<HashMap<String, Arc<Bitmap>>>,
    stamp: AtomicU64,
    placeholder: Arc<Bitmap>,
}

impl ImageLoader {
    pub fn new(origin: Url, handles: Arc<HandleRegistry>) -> Self {
        ImageLoader {
            origin,
            fetcher: None,
            handles,
            decoded: Mutex::new(HashMap::new()),
            stamp: AtomicU64::new(1),
            placeholder: Arc::new(placeholder_bitmap()),
        }
    }

    /// Allow network sources, fetched directly.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Handles this loader resolves `blob:` sources against.
    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    pub fn placeholder(&self) -> &Bitmap {
        &self.placeholder
    }

    pub fn get(&self, src: &str) -> Option<Arc<Bitmap>> {
        self.lock().get(src).cloned()
    }

    /// Everything decoded so far, keyed by source.
    pub fn snapshot(&self) -> HashMap<String, Arc<Bitmap>> {
        self.lock().clone()
    }

    /// Decode every `<img>` below `root`. Network sources get a cache-busting
    /// query unless a temporary handle is among them. Returns how many ended
    /// up on a real bitmap rather than the placeholder.
    pub async fn preload(&self, doc: &Document, root: NodeId) -> usize {
        let sources = image_sources(doc, root);
        let bust = allows_cache_bust(sources.iter().map(String::as_str));
        self.load_all(&sources, bust).await;
        sources
            .iter()
            .filter(|s| self.get(s).map(|b| !Arc::ptr_eq(&b, &self.placeholder)).unwrap_or(false))
            .count()
    }

    pub async fn load_all(&self, sources: &[String], cache_bust: bool) {
        join_all(sources.iter().map(|src| self.load(src, cache_bust))).await;
    }

    /// Decode `src`, falling back to the placeholder.
    pub async fn load(&self, src: &str, cache_bust: bool) -> Arc<Bitmap> {
        if let Some(hit) = self.get(src) {
            return hit;
        }
        let bitmap = match self.decode(src, cache_bust).await {
            Ok(b) => Arc::new(b),
            Err(e) => {
                warn!("image {} could not be decoded, using placeholder: {}", short(src), e);
                self.placeholder.clone()
            }
        };
        self.lock().insert(src.to_string(), bitmap.clone());
        bitmap
    }

    async fn decode(&self, src: &str, cache_bust: bool) -> Result<Bitmap> {
        let (bytes, content_type) = if let Some(rest) = src.strip_prefix("data:") {
            decode_data_url(rest)?
        } else if HandleRegistry::is_handle(src) {
            let (bytes, ct) = self
                .handles
                .resolve(src)
                .ok_or_else(|| Error::RenderError(format!("handle {} is not live", src)))?;
            (bytes.to_vec(), ct)
        } else {
            let fetcher = self
                .fetcher
                .as_ref()
                .ok_or_else(|| Error::NetworkError(format!("no fetcher for {}", src)))?;
            let url = self
                .origin
                .join(src)
                .map_err(|e| Error::NetworkError(format!("bad image url {:?}: {}", src, e)))?;
            let mut target = url.to_string();
            if cache_bust {
                target = cache_bust_url(&target, self.stamp.fetch_add(1, Ordering::Relaxed));
            }
            debug!("fetching image {}", target);
            let fetched = fetcher.fetch(&target).await?;
            (fetched.bytes, fetched.content_type)
        };
        decode_image(&bytes)
            .map_err(|e| Error::RenderError(format!("cannot decode {} payload: {}", content_type, e)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Bitmap>>> {
        self.decoded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `src` of every `<img>` below `root`, deduplicated, in document order.
pub fn image_sources(doc: &Document, root: NodeId) -> Vec<String> {
    let mut seen = Vec::new();
    for img in doc.elements_by_tag(root, "img") {
        if let Some(src) = doc.attr(img, "src") {
            if !src.is_empty() && !seen.contains(&src) {
                seen.push(src);
            }
        }
    }
    seen
}

fn decode_data_url(rest: &str) -> Result<(Vec<u8>, String)> {
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::RenderError("malformed data url".into()))?;
    let content_type = meta.split(';').next().unwrap_or("").to_string();
    let bytes = if meta.ends_with(";base64") {
        STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::RenderError(format!("bad base64 payload: {}", e)))?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok((bytes, content_type))
}

fn short(src: &str) -> &str {
    match src.char_indices().nth(64) {
        Some((i, _)) => &src[..i],
        None => src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{Fetched, StaticFetcher};
    use crate::rendering::raster::encode_png;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(rgba: [u8; 4]) -> Vec<u8> {
        let b = Bitmap::solid(2, 2, rgba);
        encode_png(2, 2, &b.rgba).unwrap()
    }

    #[test]
    fn cache_bust_only_without_handles() {
        assert!(allows_cache_bust(["https://cdn/a.png", "data:image/png;base64,AA=="]));
        assert!(!allows_cache_bust(["https://cdn/a.png", "blob:snapframe/abc-0"]));
        assert_eq!(cache_bust_url("https://cdn/a.png", 7), "https://cdn/a.png?cacheBust=7");
        assert_eq!(cache_bust_url("https://cdn/a.png?w=2", 7), "https://cdn/a.png?w=2&cacheBust=7");
    }

    #[tokio::test]
    async fn resolves_handles_data_urls_and_network() {
        let handles = Arc::new(HandleRegistry::new());
        let h = handles.create(Arc::from(png([255, 0, 0, 255])), "image/png");
        let data = format!("data:image/png;base64,{}", STANDARD.encode(png([0, 255, 0, 255])));
        let fetcher = Arc::new(
            StaticFetcher::new().route("https://recap.example/a.png", Fetched::new(png([0, 0, 255, 255]), "image/png")),
        );
        let loader = ImageLoader::new(Url::parse("https://recap.example").unwrap(), handles)
            .with_fetcher(fetcher.clone());

        assert_eq!(loader.load(&h, false).await.pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(loader.load(&data, false).await.pixel(1, 1), Some([0, 255, 0, 255]));
        assert_eq!(loader.load("/a.png", false).await.pixel(0, 1), Some([0, 0, 255, 255]));
        loader.load("/a.png", false).await;
        assert_eq!(fetcher.hits("https://recap.example/a.png"), 1);
    }

    #[tokio::test]
    async fn network_jpeg_is_decoded() {
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 0, 255])))
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();
        let fetcher = Arc::new(
            StaticFetcher::new().route("https://recap.example/avatar.jpg", Fetched::new(jpeg, "image/jpeg")),
        );
        let loader = ImageLoader::new(Url::parse("https://recap.example").unwrap(), Arc::new(HandleRegistry::new()))
            .with_fetcher(fetcher);
        let bmp = loader.load("/avatar.jpg", false).await;
        assert_eq!((bmp.width, bmp.height), (8, 8));
        assert!(bmp.pixel(4, 4).unwrap()[2] > 240);
    }

    #[tokio::test]
    async fn preload_busts_only_without_handles() {
        let logo = "https://recap.example/assets/logo.png";
        let busted = "https://recap.example/assets/logo.png?cacheBust=1";
        let fetcher = Arc::new(StaticFetcher::new().route(busted, Fetched::new(png([0, 0, 0, 255]), "image/png")));
        let doc = Document::new("https://recap.example").unwrap();
        let img = doc.create_element("img");
        doc.set_attr(img, "src", "/assets/logo.png");
        doc.append_child(doc.body(), img).unwrap();

        let loader = ImageLoader::new(Url::parse("https://recap.example").unwrap(), Arc::new(HandleRegistry::new()))
            .with_fetcher(fetcher.clone());
        assert_eq!(loader.preload(&doc, doc.body()).await, 1);
        assert_eq!((fetcher.hits(busted), fetcher.hits(logo)), (1, 0));

        let handles = Arc::new(HandleRegistry::new());
        let avatar = doc.create_element("img");
        doc.set_attr(avatar, "src", &handles.create(Arc::from(png([9, 9, 9, 255])), "image/png"));
        doc.append_child(doc.body(), avatar).unwrap();
        let loader = ImageLoader::new(Url::parse("https://recap.example").unwrap(), handles).with_fetcher(fetcher.clone());
        assert_eq!(loader.preload(&doc, doc.body()).await, 1);
        assert_eq!((fetcher.hits(busted), fetcher.hits(logo)), (1, 1));
    }

    #[tokio::test]
    async fn failures_fall_back_to_placeholder() {
        let loader = ImageLoader::new(
            Url::parse("https://recap.example").unwrap(),
            Arc::new(HandleRegistry::new()),
        );
        let svg = crate::inline::IMAGE_PLACEHOLDER;
        assert_eq!(loader.load(svg, false).await.pixel(0, 0), Some(PLACEHOLDER_RGBA));
        assert_eq!(loader.load("blob:snapframe/revoked-0", false).await.pixel(0, 0), Some(PLACEHOLDER_RGBA));
    }
}

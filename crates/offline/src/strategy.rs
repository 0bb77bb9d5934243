use crate::fetch::FetchRequest;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"];
const FONT_EXTENSIONS: &[&str] = &["woff", "woff2", "ttf", "otf", "eot"];
const CODE_EXTENSIONS: &[&str] = &["css", "js"];
const API_PREFIX: &str = "/api/";

/// How a request is resolved against the caches and the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Asset class derived from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    Api,
    Image,
    Font,
    Code,
    Page,
    Other,
}

impl AssetClass {
    pub fn strategy(self) -> Strategy {
        match self {
            Self::Api | Self::Other => Strategy::NetworkFirst,
            Self::Image | Self::Font | Self::Code => Strategy::CacheFirst,
            Self::Page => Strategy::StaleWhileRevalidate,
        }
    }
}

/// Classifies a request. Rules are evaluated in priority order and the first
/// match wins, so `/api/logo.png` is still an API call.
pub fn classify(request: &FetchRequest) -> AssetClass {
    let path = request.url.path();
    if path.starts_with(API_PREFIX) || path == "/api" {
        return AssetClass::Api;
    }

    let extension = extension(path);
    match extension.as_deref() {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => AssetClass::Image,
        Some(ext) if FONT_EXTENSIONS.contains(&ext) => AssetClass::Font,
        Some(ext) if CODE_EXTENSIONS.contains(&ext) => AssetClass::Code,
        _ if request.is_navigation() || extension.is_none() => AssetClass::Page,
        _ => AssetClass::Other,
    }
}

pub fn strategy_for(request: &FetchRequest) -> Strategy {
    classify(request).strategy()
}

fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next().unwrap_or_default();
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn get(path: &str) -> FetchRequest {
        FetchRequest::get(Url::parse("https://example.com").expect("base").join(path).expect("url"))
    }

    fn nav(path: &str) -> FetchRequest {
        FetchRequest::navigate(
            Url::parse("https://example.com").expect("base").join(path).expect("url"),
        )
    }

    #[test]
    fn api_prefix_wins_over_extension() {
        assert_eq!(classify(&get("/api/data")), AssetClass::Api);
        assert_eq!(classify(&get("/api/logo.png")), AssetClass::Api);
        assert_eq!(strategy_for(&get("/api/data")), Strategy::NetworkFirst);
    }

    #[test]
    fn static_assets_are_cache_first() {
        assert_eq!(classify(&get("/images/hero.WEBP")), AssetClass::Image);
        assert_eq!(classify(&get("/fonts/inter.woff2")), AssetClass::Font);
        assert_eq!(classify(&get("/assets/style.css")), AssetClass::Code);
        assert_eq!(classify(&get("/js/main.js?v=3")), AssetClass::Code);
        for path in ["/images/a.png", "/fonts/a.ttf", "/assets/style.css"] {
            assert_eq!(strategy_for(&get(path)), Strategy::CacheFirst);
        }
    }

    #[test]
    fn pages_are_stale_while_revalidate() {
        assert_eq!(classify(&nav("/about.html")), AssetClass::Page);
        assert_eq!(classify(&get("/pricing")), AssetClass::Page);
        assert_eq!(classify(&get("/")), AssetClass::Page);
        assert_eq!(classify(&get("/.well-known/")), AssetClass::Page);
        assert_eq!(strategy_for(&get("/pricing")), Strategy::StaleWhileRevalidate);
    }

    #[test]
    fn navigation_to_an_image_is_still_an_image() {
        assert_eq!(classify(&nav("/images/og.png")), AssetClass::Image);
    }

    #[test]
    fn everything_else_is_network_first() {
        assert_eq!(classify(&get("/manifest.json")), AssetClass::Other);
        assert_eq!(classify(&get("/sitemap.xml")), AssetClass::Other);
        assert_eq!(strategy_for(&get("/robots.txt")), Strategy::NetworkFirst);
    }
}

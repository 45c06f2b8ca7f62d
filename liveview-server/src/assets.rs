//! Bundled static assets, embedded at compile time so the binary is
//! self-contained.

/// One embedded asset.
#[derive(Debug, Clone, Copy)]
pub struct StaticAsset {
    pub content_type: &'static str,
    pub body: &'static [u8],
}

const INDEX_HTML: &[u8] = include_bytes!("../web/index.html");
const SCRIPT_JS: &[u8] = include_bytes!("../web/script.js");
const STYLE_CSS: &[u8] = include_bytes!("../web/style.css");

/// Resolve a request path to an embedded asset. `/` maps to the index page.
pub fn lookup(path: &str) -> Option<StaticAsset> {
    match path {
        "/" | "/index.html" => Some(StaticAsset {
            content_type: "text/html; charset=utf-8",
            body: INDEX_HTML,
        }),
        "/script.js" => Some(StaticAsset {
            content_type: "text/javascript; charset=utf-8",
            body: SCRIPT_JS,
        }),
        "/style.css" => Some(StaticAsset {
            content_type: "text/css; charset=utf-8",
            body: STYLE_CSS,
        }),
        _ => None,
    }
}

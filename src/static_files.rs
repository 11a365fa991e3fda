//! Static files and directory listings.
//!
//! Only GET and HEAD are handled; anything else, and anything that does not
//! resolve to a readable file or directory under the root, is passed on to
//! the next stage.

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::pipeline::{Flow, Outcome, Stage, claim};

const INDEX_FILE: &str = "index.html";

/// Entry in a directory listing
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: FileType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListingFormat {
    Html,
    Json,
    Plain,
}

/// Serves files and directory listings from `root`.
#[derive(Debug, Clone)]
pub struct StaticFileResolver {
    root: PathBuf,
}

impl StaticFileResolver {
    pub const NAME: &'static str = "static";

    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Try to answer a GET or HEAD for `raw_path`.
    async fn resolve(
        &self,
        method: &Method,
        raw_path: &str,
        format: ListingFormat,
    ) -> Option<Response> {
        let decoded = match urlencoding::decode(raw_path) {
            Ok(path) => path.into_owned(),
            Err(_) => {
                debug!("Request path is not valid UTF-8 after decoding: {}", raw_path);
                return None;
            }
        };

        let path = match resolve_and_verify_path(&self.root, &decoded) {
            Ok(path) => path,
            Err(e) => {
                warn!("Not serving {}: {}", raw_path, e);
                return None;
            }
        };

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                return None;
            }
        };

        if metadata.is_file() {
            // A trailing slash asks for a directory.
            if raw_path.ends_with('/') {
                return None;
            }
            return serve_file(method, &path, &metadata).await;
        }

        if !metadata.is_dir() {
            return None;
        }

        let index = path.join(INDEX_FILE);
        if let Ok(index_metadata) = fs::metadata(&index).await
            && index_metadata.is_file()
        {
            return serve_file(method, &index, &index_metadata).await;
        }

        let is_root = self
            .root
            .canonicalize()
            .map(|root| root == path)
            .unwrap_or(false);
        match list_directory(&path).await {
            Ok(entries) => Some(render_listing(method, format, &decoded, is_root, &entries)),
            Err(e) => {
                warn!("Cannot list {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl Stage for StaticFileResolver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn handle(&self, request: Request<Body>) -> Flow {
        if *request.method() != Method::GET && *request.method() != Method::HEAD {
            return Flow::Continue(request);
        }

        let method = request.method().clone();
        let raw_path = request.uri().path().to_string();
        let format = preferred_format(request.headers());

        match self.resolve(&method, &raw_path, format).await {
            Some(response) => Flow::Respond(response),
            None => Flow::Continue(request),
        }
    }
}

// ============================================================================
// Path resolution
// ============================================================================

/// Map a request path onto the root, component by component.
///
/// Parent references, absolute components and NUL bytes are rejected outright
/// rather than normalized away.
fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf, ResolveError> {
    let relative = relative.trim_start_matches('/');

    if relative.is_empty() || relative == "." {
        return Ok(root.to_path_buf());
    }

    let mut result = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                if name.to_string_lossy().contains('\0') {
                    return Err(ResolveError::InvalidPath(relative.to_string()));
                }
                result.push(name);
            }
            Component::CurDir => continue,
            Component::ParentDir => return Err(ResolveError::PathTraversal),
            Component::RootDir | Component::Prefix(_) => {
                return Err(ResolveError::PathTraversal);
            }
        }
    }

    if !result.starts_with(root) {
        return Err(ResolveError::PathTraversal);
    }

    Ok(result)
}

/// Resolve a path and, if it exists, make sure symlinks do not lead outside
/// the canonical root.
fn resolve_and_verify_path(root: &Path, relative: &str) -> Result<PathBuf, ResolveError> {
    let built_path = resolve_path(root, relative)?;

    if !built_path.exists() {
        return Ok(built_path);
    }

    let canonical_root = root.canonicalize()?;
    let canonical_path = built_path.canonicalize()?;
    if !canonical_path.starts_with(&canonical_root) {
        warn!(
            "Symlink escape attempt: {:?} resolved to {:?} which is outside {:?}",
            built_path, canonical_path, canonical_root
        );
        return Err(ResolveError::PathTraversal);
    }

    Ok(canonical_path)
}

// ============================================================================
// Files
// ============================================================================

async fn serve_file(method: &Method, path: &Path, metadata: &Metadata) -> Option<Response> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot open {}: {}", path.display(), e);
            return None;
        }
    };

    debug!("Streaming file: {}", path.display());

    let mime = mime_guess::from_path(path).first_or_octet_stream().to_string();

    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_LENGTH, metadata.len().to_string()),
        ],
        body,
    )
        .into_response();

    if let Some(modified) = metadata.modified().ok().map(http_date)
        && let Ok(value) = modified.parse()
    {
        response.headers_mut().insert(header::LAST_MODIFIED, value);
    }

    Some(claim(response, Outcome::FileServed))
}

fn http_date(time: std::time::SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

// ============================================================================
// Directory listings
// ============================================================================

/// Immediate children of `dir`, dotfiles excluded, directories first.
async fn list_directory(dir: &Path) -> std::io::Result<Vec<ListingEntry>> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;

    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }

        // Follow symlinks so linked directories list as directories.
        let metadata = match fs::metadata(entry.path()).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };

        let (node_type, size) = if metadata.is_dir() {
            (FileType::Directory, None)
        } else {
            (FileType::File, Some(metadata.len()))
        };
        entries.push(ListingEntry {
            name,
            node_type,
            size,
        });
    }

    entries.sort_by(|a, b| match (a.node_type, b.node_type) {
        (FileType::Directory, FileType::File) => std::cmp::Ordering::Less,
        (FileType::File, FileType::Directory) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    Ok(entries)
}

fn preferred_format(headers: &HeaderMap) -> ListingFormat {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if accept.contains("text/html") {
        ListingFormat::Html
    } else if accept.contains("application/json") {
        ListingFormat::Json
    } else if accept.contains("text/plain") {
        ListingFormat::Plain
    } else {
        ListingFormat::Html
    }
}

fn render_listing(
    method: &Method,
    format: ListingFormat,
    decoded_path: &str,
    is_root: bool,
    entries: &[ListingEntry],
) -> Response {
    let (content_type, body) = match format {
        ListingFormat::Json => (
            "application/json; charset=utf-8",
            serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string()),
        ),
        ListingFormat::Plain => {
            let mut body = String::new();
            for entry in entries {
                body.push_str(&entry.name);
                if entry.node_type == FileType::Directory {
                    body.push('/');
                }
                body.push('\n');
            }
            ("text/plain; charset=utf-8", body)
        }
        ListingFormat::Html => (
            "text/html; charset=utf-8",
            listing_html(decoded_path, is_root, entries),
        ),
    };

    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(body)
    };

    let response = (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response();
    claim(response, Outcome::ListingServed)
}

/// Normalized `/a/b/` form of the request path, each segment re-encoded.
fn href_base(decoded_path: &str) -> String {
    let mut base = String::from("/");
    for segment in decoded_path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        base.push_str(&urlencoding::encode(segment));
        base.push('/');
    }
    base
}

fn listing_html(decoded_path: &str, is_root: bool, entries: &[ListingEntry]) -> String {
    let base = href_base(decoded_path);
    let title = escape_html(&format!("listing directory {}", display_path(decoded_path)));

    let mut items = String::new();
    if !is_root {
        let parent = match base.trim_end_matches('/').rfind('/') {
            Some(idx) => &base[..=idx],
            None => "/",
        };
        items.push_str(&format!(
            "      <li><a href=\"{}\" class=\"dir parent\">../</a></li>\n",
            parent
        ));
    }
    for entry in entries {
        let (class, suffix) = match entry.node_type {
            FileType::Directory => ("dir", "/"),
            FileType::File => ("file", ""),
        };
        items.push_str(&format!(
            "      <li><a href=\"{base}{href}{suffix}\" class=\"{class}\" title=\"{name}\">{name}{suffix}</a></li>\n",
            href = urlencoding::encode(&entry.name),
            name = escape_html(&entry.name),
        ));
    }

    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head>\n\
         <meta charset=\"utf-8\">\n\
         <title>{title}</title>\n\
         <style>\n\
         body {{ font-family: monospace; margin: 2em; }}\n\
         ul {{ list-style: none; padding: 0; }}\n\
         li {{ padding: 0.15em 0; }}\n\
         a.dir {{ font-weight: bold; }}\n\
         a.dir::before {{ content: \"\\1F4C1  \"; }}\n\
         a.file::before {{ content: \"\\1F4C4  \"; }}\n\
         </style>\n\
         </head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <ul>\n\
         {items}\
         </ul>\n\
         </body>\n\
         </html>\n"
    )
}

fn display_path(decoded_path: &str) -> String {
    let base = href_base(decoded_path);
    urlencoding::decode(&base)
        .map(|p| p.into_owned())
        .unwrap_or(base)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

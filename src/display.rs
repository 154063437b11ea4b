//! Image display adapter.
//!
//! Turns staged image bytes into something a presentation layer can render:
//! a revocable object URL when the host keeps a blob registry, otherwise a
//! base64 `data:` URI. Both decode to the same bytes.

use crate::error::{BackendStage, RunnerError};
use crate::native::ConversionBackend;
use crate::store::{Area, StagedFileStore};
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;

const OBJECT_URL_PREFIX: &str = "blob:diffusion-runner/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum DisplayHandle {
    ObjectUrl(String),
    DataUri(String),
}

impl DisplayHandle {
    pub fn url(&self) -> &str {
        match self {
            DisplayHandle::ObjectUrl(url) | DisplayHandle::DataUri(url) => url,
        }
    }
}

/// What the hosting environment supports for rendering images.
#[derive(Debug, Clone, Copy)]
pub struct HostCapabilities {
    pub object_urls: bool,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self { object_urls: true }
    }
}

#[derive(Debug, Clone)]
struct Blob {
    mime: &'static str,
    bytes: Bytes,
}

/// Registry backing `blob:` handles.
#[derive(Debug, Default)]
pub struct BlobRegistry {
    next_id: u64,
    blobs: HashMap<String, Blob>,
}

impl BlobRegistry {
    pub fn create_object_url(&mut self, bytes: Bytes, mime: &'static str) -> String {
        self.next_id += 1;
        let url = format!("{OBJECT_URL_PREFIX}{}", self.next_id);
        self.blobs.insert(url.clone(), Blob { mime, bytes });
        url
    }

    pub fn resolve(&self, url: &str) -> Option<(&'static str, Bytes)> {
        self.blobs.get(url).map(|b| (b.mime, b.bytes.clone()))
    }

    /// Returns false when the URL was unknown or already revoked.
    pub fn revoke(&mut self, url: &str) -> bool {
        self.blobs.remove(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[derive(Debug)]
pub struct DisplayAdapter {
    registry: Option<BlobRegistry>,
}

impl DisplayAdapter {
    pub fn new(caps: HostCapabilities) -> Self {
        Self {
            registry: caps.object_urls.then(BlobRegistry::default),
        }
    }

    pub fn to_displayable(&mut self, bytes: Bytes, name: &str) -> DisplayHandle {
        let mime = mime_for(name);
        match self.registry.as_mut() {
            Some(registry) => DisplayHandle::ObjectUrl(registry.create_object_url(bytes, mime)),
            None => DisplayHandle::DataUri(data_uri(&bytes, mime)),
        }
    }

    /// Bytes behind a handle, whichever representation was chosen.
    pub fn decode(&self, handle: &DisplayHandle) -> Option<Bytes> {
        match handle {
            DisplayHandle::ObjectUrl(url) => self
                .registry
                .as_ref()
                .and_then(|r| r.resolve(url))
                .map(|(_, bytes)| bytes),
            DisplayHandle::DataUri(uri) => decode_data_uri(uri),
        }
    }

    pub fn revoke(&mut self, handle: &DisplayHandle) {
        if let (DisplayHandle::ObjectUrl(url), Some(registry)) = (handle, self.registry.as_mut()) {
            registry.revoke(url);
        }
    }

    pub fn live_handles(&self) -> usize {
        self.registry.as_ref().map_or(0, BlobRegistry::len)
    }
}

pub fn data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64_ENGINE.encode(bytes))
}

pub fn decode_data_uri(uri: &str) -> Option<Bytes> {
    let (_, payload) = uri.strip_prefix("data:")?.split_once(";base64,")?;
    BASE64_ENGINE.decode(payload).ok().map(Bytes::from)
}

pub fn mime_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Run the external converter from `raw/<raw_name>` to `display/<display_name>`.
pub fn convert_and_resample(
    converter: &dyn ConversionBackend,
    store: &mut StagedFileStore,
    raw_name: &str,
    display_name: &str,
) -> Result<(), RunnerError> {
    let raw_path = Area::Raw.path(raw_name);
    let display_path = Area::Display.path(display_name);
    if !store.has(Area::Raw, raw_name) {
        return Err(RunnerError::NotFound { path: raw_path });
    }
    let status = converter.convert_and_resample(store, &raw_path, &display_path);
    if status != 0 {
        return Err(RunnerError::Backend {
            stage: BackendStage::Conversion,
            status,
        });
    }
    if !store.has(Area::Display, display_name) {
        return Err(RunnerError::NotFound { path: display_path });
    }
    Ok(())
}

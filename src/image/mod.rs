//! In-memory model of a loaded container image.
//!
//! Layer archives are unpacked to disk under a temporary directory owned by
//! the [`LoadedImage`]; dropping the image removes the extracted tree.

pub mod loader;
pub mod source;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tempfile::TempDir;

pub use loader::load_image;
pub use source::{detect_source, Credential, SourceKind};

/// One entry from the image config's `history` array.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoryEntry {
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub empty_layer: bool,
}

/// A regular file extracted from a layer archive.
#[derive(Debug, Clone)]
pub struct LayerFile {
    /// Absolute path inside the image filesystem, with a leading `/`.
    pub path: String,
    pub size: u64,
    /// Location of the extracted contents on the host.
    pub disk_path: PathBuf,
}

/// Contents of one non-empty layer.
#[derive(Debug, Clone)]
pub struct LayerArchive {
    /// diff_id of the uncompressed layer tar.
    pub digest: String,
    /// Sum of the regular-file sizes recorded in the tar headers.
    pub size: u64,
    pub files: Vec<LayerFile>,
    /// Paths deleted by this layer (`.wh.` markers), leading `/` included.
    pub whiteouts: Vec<String>,
    /// Directories wiped by this layer (`.wh..wh..opq` markers).
    pub opaque_dirs: Vec<String>,
}

/// A container image ready for layer reconstruction and cataloging.
pub struct LoadedImage {
    /// Config blob digest, used as the image id.
    pub id: String,
    /// `sha256:`-prefixed digest identifying the manifest.
    pub manifest_digest: String,
    /// Build history, one entry per instruction including empty layers.
    pub history: Vec<HistoryEntry>,
    /// Non-empty layers in application order.
    pub layers: Vec<LayerArchive>,
    /// Keeps the extracted tree alive for the lifetime of the image.
    #[allow(dead_code)]
    workdir: Option<TempDir>,
}

impl LoadedImage {
    pub fn from_parts(
        id: impl Into<String>,
        manifest_digest: impl Into<String>,
        history: Vec<HistoryEntry>,
        layers: Vec<LayerArchive>,
        workdir: Option<TempDir>,
    ) -> Self {
        Self {
            id: id.into(),
            manifest_digest: manifest_digest.into(),
            history,
            layers,
            workdir,
        }
    }

    /// Compute the squashed filesystem view: for every path that survives
    /// all layers, the index (into `layers`) of the layer whose copy wins.
    ///
    /// Whiteouts remove the named path and anything beneath it; opaque
    /// directory markers remove everything previously recorded under the
    /// directory before the layer's own files apply.
    pub fn squashed_view(&self) -> HashMap<String, usize> {
        let mut view: HashMap<String, usize> = HashMap::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            for dir in &layer.opaque_dirs {
                let prefix = format!("{}/", dir.trim_end_matches('/'));
                view.retain(|path, _| !path.starts_with(&prefix));
            }
            for gone in &layer.whiteouts {
                let prefix = format!("{}/", gone.trim_end_matches('/'));
                view.retain(|path, _| path != gone && !path.starts_with(&prefix));
            }
            for file in &layer.files {
                view.insert(file.path.clone(), idx);
            }
        }
        view
    }
}

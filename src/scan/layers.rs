//! Layer reconstruction: align extracted layers with build history and
//! inventory the executable files each layer contributed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::{Error, Result};
use crate::image::{LayerFile, LoadedImage};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const SHELL_COMMAND_PREFIX: &str = "/bin/sh -c ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileCategory {
    #[serde(rename = "ELF")]
    Elf,
}

/// An executable discovered inside a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableFile {
    /// Hex sha256 of the full file contents.
    pub digest: String,
    pub path: String,
    pub size: u64,
    pub category: FileCategory,
    /// Whether this exact copy is the one visible in the squashed image.
    pub in_squashed_image: bool,
}

/// One reconstructed layer, empty or not, in build order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    pub digest: String,
    /// Creating instruction with any shell wrapper stripped.
    pub command: String,
    pub size: u64,
    pub index: usize,
    pub is_empty: bool,
    pub files: Vec<ExecutableFile>,
}

/// Rebuild the per-instruction layer list for a loaded image.
///
/// Every history entry yields a record. Empty layers carry a synthetic
/// digest derived from the manifest digest so each stays unique; non-empty
/// entries consume the extracted layers in order. A count mismatch between
/// history and extracted layers means the image is inconsistent and the
/// whole reconstruction fails.
pub fn reconstruct_layers(image: &LoadedImage) -> Result<Vec<LayerRecord>> {
    let non_empty = image.history.iter().filter(|h| !h.empty_layer).count();
    if non_empty != image.layers.len() {
        return Err(Error::LayersGeneration(format!(
            "history expects {} filesystem layers but the image carries {}",
            non_empty,
            image.layers.len()
        )));
    }

    let squashed = image.squashed_view();
    let mut records = Vec::with_capacity(image.history.len());
    let mut cursor = 0usize;

    for (index, entry) in image.history.iter().enumerate() {
        let command = strip_shell_prefix(&entry.created_by);
        if entry.empty_layer {
            records.push(LayerRecord {
                digest: format!("{}_{}", image.manifest_digest, index),
                command,
                size: 0,
                index,
                is_empty: true,
                files: Vec::new(),
            });
            continue;
        }

        let layer = &image.layers[cursor];
        let files = collect_executables(image, cursor, &squashed);
        records.push(LayerRecord {
            digest: layer.digest.clone(),
            command,
            size: layer.size,
            index,
            is_empty: false,
            files,
        });
        cursor += 1;
    }

    Ok(records)
}

fn strip_shell_prefix(created_by: &str) -> String {
    created_by
        .strip_prefix(SHELL_COMMAND_PREFIX)
        .unwrap_or(created_by)
        .to_string()
}

fn collect_executables(
    image: &LoadedImage,
    layer_idx: usize,
    squashed: &HashMap<String, usize>,
) -> Vec<ExecutableFile> {
    let mut out = Vec::new();
    for file in &image.layers[layer_idx].files {
        let digest = match read_elf_digest(&file.disk_path) {
            Ok(Some(digest)) => digest,
            Ok(None) => continue,
            Err(err) => {
                warn!(path = %file.path, error = %err, "skipping unreadable layer file");
                continue;
            }
        };
        let in_squashed_image = is_squashed_copy(image, layer_idx, file, &digest, squashed);
        out.push(ExecutableFile {
            digest,
            path: file.path.clone(),
            size: file.size,
            category: FileCategory::Elf,
            in_squashed_image,
        });
    }
    out
}

/// A file counts as squashed when its path survives to the final view and
/// the surviving copy has identical contents. The common cases resolve by
/// layer index alone; only a later overwrite forces a second hash.
fn is_squashed_copy(
    image: &LoadedImage,
    layer_idx: usize,
    file: &LayerFile,
    digest: &str,
    squashed: &HashMap<String, usize>,
) -> bool {
    match squashed.get(&file.path) {
        None => false,
        Some(&winner) if winner == layer_idx => true,
        Some(&winner) => {
            let Some(winner_file) = image.layers[winner]
                .files
                .iter()
                .rev()
                .find(|f| f.path == file.path)
            else {
                return false;
            };
            match sha256_file(&winner_file.disk_path) {
                Ok(winner_digest) => winner_digest == digest,
                Err(err) => {
                    warn!(path = %file.path, error = %err, "failed to hash squashed copy");
                    false
                }
            }
        }
    }
}

/// Hash a file if it is an ELF binary. Returns `None` for anything too
/// short to carry the magic or starting with different bytes.
fn read_elf_digest(path: &Path) -> io::Result<Option<String>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..])?;
        if n == 0 {
            return Ok(None);
        }
        read += n;
    }
    if magic != ELF_MAGIC {
        return Ok(None);
    }
    let mut hasher = Sha256::new();
    hasher.update(magic);
    io::copy(&mut file, &mut hasher)?;
    Ok(Some(hex::encode(hasher.finalize())))
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

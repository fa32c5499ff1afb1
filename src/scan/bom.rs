//! Package catalog (SBOM) generation and tag normalization.

use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};

use crate::errors::Result;
use crate::image::LoadedImage;

/// Produces the package inventory attached to a scan request.
///
/// The trait seam lets an external cataloger (or a test stub) replace the
/// built-in one without touching the orchestration code.
pub trait PackageCataloger: Send + Sync {
    fn catalog(&self, image: &LoadedImage) -> Result<Value>;
    /// Version string reported to the backend alongside the catalog.
    fn version(&self) -> &str;
}

/// Minimal cataloger that records image identity and per-layer file counts.
/// Deep package resolution happens server-side from the submitted layers.
pub struct BuiltinCataloger;

impl PackageCataloger for BuiltinCataloger {
    fn catalog(&self, image: &LoadedImage) -> Result<Value> {
        let layers: Vec<Value> = image
            .layers
            .iter()
            .map(|l| json!({"digest": l.digest, "size": l.size, "files": l.files.len()}))
            .collect();
        Ok(json!({
            "source": {
                "id": image.id,
                "manifest_digest": image.manifest_digest,
            },
            "layers": layers,
        }))
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }
}

/// SBOM plus the identifying tag it was generated for.
#[derive(Debug, Clone, Serialize)]
pub struct Bom {
    pub full_tag: String,
    pub manifest_digest: String,
    pub packages: Value,
}

/// Catalog the image and pair the result with its report tag.
pub fn generate_bom(
    image: &LoadedImage,
    input: &str,
    override_tag: Option<&str>,
    cataloger: &dyn PackageCataloger,
) -> Result<Bom> {
    let packages = cataloger.catalog(image)?;
    Ok(Bom {
        full_tag: normalize_full_tag(input, override_tag, &image.manifest_digest),
        manifest_digest: image.manifest_digest.clone(),
        packages,
    })
}

/// Derive the tag the backend files the report under.
///
/// An explicit override always wins. Digest references are rewritten so the
/// tag stays a single path segment, archive inputs get a digest-based tag,
/// and bare references are padded with the default registry and tag.
pub fn normalize_full_tag(input: &str, override_tag: Option<&str>, manifest_digest: &str) -> String {
    if let Some(tag) = override_tag {
        return tag.to_string();
    }
    if let Some((name, digest)) = input.split_once("@sha256:") {
        return format!("{name}:sha256_{digest}");
    }
    if input.ends_with(".tar") || input.ends_with(".tar.gz") || input.ends_with(".tgz") {
        let stem = Path::new(input)
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| {
                n.trim_end_matches(".tar")
                    .trim_end_matches(".tar.gz")
                    .trim_end_matches(".tgz")
            })
            .unwrap_or(input);
        let hex_part = manifest_digest
            .strip_prefix("sha256:")
            .unwrap_or(manifest_digest);
        return format!("{stem}:{hex_part}");
    }
    normalize_reference(input)
}

/// Expand a short registry reference to its canonical form.
fn normalize_reference(input: &str) -> String {
    let (name, tag) = match input.rsplit_once(':') {
        // A colon inside the last path segment is a tag; one before a slash
        // is a registry port.
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (input.to_string(), "latest".to_string()),
    };
    let name = match name.split('/').next() {
        Some(first)
            if name.contains('/')
                && (first.contains('.') || first.contains(':') || first == "localhost") =>
        {
            name
        }
        _ if name.contains('/') => format!("docker.io/{name}"),
        _ => format!("docker.io/library/{name}"),
    };
    format!("{name}:{tag}")
}

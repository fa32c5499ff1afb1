//! Image acquisition: local archives, the Docker daemon, and remote
//! registries all converge on a [`LoadedImage`].

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use oci_distribution::client::{linux_amd64_resolver, Client as RegistryClient, ClientConfig};
use oci_distribution::manifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::events::ProgressSink;
use crate::image::source::{detect_source, Credential, SourceKind};
use crate::image::{HistoryEntry, LayerArchive, LayerFile, LoadedImage};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Skip the daemon and resolve non-file inputs against the registry,
    /// falling back to the daemon only if the pull fails.
    pub bypass_docker_daemon: bool,
    pub credential: Option<Credential>,
}

/// `manifest.json` entry inside a `docker save` tarball.
#[derive(Deserialize)]
struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

#[derive(Deserialize)]
struct ImageConfig {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    rootfs: RootFs,
}

#[derive(Deserialize, Default)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

#[derive(Deserialize)]
struct OciIndex {
    manifests: Vec<OciDescriptor>,
}

#[derive(Deserialize)]
struct OciDescriptor {
    digest: String,
}

#[derive(Deserialize)]
struct OciManifest {
    config: OciDescriptor,
    layers: Vec<OciDescriptor>,
}

/// Resolve `input` to a fully extracted image.
pub async fn load_image(
    input: &str,
    opts: &LoadOptions,
    sink: Arc<dyn ProgressSink>,
) -> Result<LoadedImage> {
    let kind = detect_source(input, opts.bypass_docker_daemon)?;
    debug!(input, ?kind, "resolved image source");
    match kind {
        SourceKind::DockerArchive => {
            sink.stage("Loading docker archive");
            load_docker_archive(Path::new(input))
        }
        SourceKind::OciArchive => {
            sink.stage("Loading OCI archive");
            load_oci_archive(Path::new(input))
        }
        SourceKind::DockerDaemon => {
            sink.stage("Exporting image from the Docker daemon");
            load_from_daemon(input).await
        }
        SourceKind::Registry => {
            sink.stage("Pulling image from registry");
            match load_from_registry(input, opts.credential.as_ref()).await {
                Ok(image) => Ok(image),
                Err(err) if !opts.bypass_docker_daemon => Err(err),
                Err(err) => {
                    if crate::image::source::daemon_available() {
                        warn!(input, error = %err, "registry pull failed, retrying via daemon");
                        sink.stage("Exporting image from the Docker daemon");
                        load_from_daemon(input).await
                    } else {
                        Err(err)
                    }
                }
            }
        }
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    let file = File::open(path)?;
    if n == 2 && magic == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn unpack_outer_tar(path: &Path) -> Result<TempDir> {
    let dir = TempDir::new()?;
    let reader = open_maybe_gzip(path)?;
    let mut archive = tar::Archive::new(reader);
    archive.unpack(dir.path())?;
    Ok(dir)
}

fn load_docker_archive(path: &Path) -> Result<LoadedImage> {
    let workdir = unpack_outer_tar(path)?;
    let manifest_bytes = fs::read(workdir.path().join("manifest.json"))?;
    let manifest_digest = format!("sha256:{}", sha256_hex(&manifest_bytes));

    let entries: Vec<ArchiveManifestEntry> =
        serde_json::from_slice(&manifest_bytes).map_err(|e| Error::ImageLoad {
            input: path.display().to_string(),
            reason: format!("malformed manifest.json: {e}"),
        })?;
    let entry = entries.into_iter().next().ok_or_else(|| Error::ImageLoad {
        input: path.display().to_string(),
        reason: "archive manifest lists no images".into(),
    })?;

    let config_bytes = fs::read(workdir.path().join(&entry.config))?;
    let id = format!("sha256:{}", sha256_hex(&config_bytes));
    let config: ImageConfig = serde_json::from_slice(&config_bytes).map_err(|e| {
        Error::ImageLoad {
            input: path.display().to_string(),
            reason: format!("malformed image config: {e}"),
        }
    })?;

    let layer_paths: Vec<PathBuf> = entry
        .layers
        .iter()
        .map(|rel| workdir.path().join(rel))
        .collect();
    let layers = extract_layers(&layer_paths, &config.rootfs.diff_ids, workdir.path())?;

    info!(id, manifest_digest, layers = layers.len(), "loaded docker archive");
    Ok(LoadedImage::from_parts(
        id,
        manifest_digest,
        config.history,
        layers,
        Some(workdir),
    ))
}

fn load_oci_archive(path: &Path) -> Result<LoadedImage> {
    let workdir = unpack_outer_tar(path)?;
    let bad = |reason: String| Error::ImageLoad {
        input: path.display().to_string(),
        reason,
    };

    let index: OciIndex = serde_json::from_slice(&fs::read(workdir.path().join("index.json"))?)
        .map_err(|e| bad(format!("malformed index.json: {e}")))?;
    let manifest_digest = index
        .manifests
        .first()
        .map(|d| d.digest.clone())
        .ok_or_else(|| bad("layout index lists no manifests".into()))?;

    let blob = |digest: &str| -> Result<Vec<u8>> {
        let hex_part = digest.strip_prefix("sha256:").unwrap_or(digest);
        Ok(fs::read(workdir.path().join("blobs/sha256").join(hex_part))?)
    };

    let oci_manifest: OciManifest = serde_json::from_slice(&blob(&manifest_digest)?)
        .map_err(|e| bad(format!("malformed image manifest: {e}")))?;
    let config_bytes = blob(&oci_manifest.config.digest)?;
    let config: ImageConfig = serde_json::from_slice(&config_bytes)
        .map_err(|e| bad(format!("malformed image config: {e}")))?;

    let hex_of = |digest: &str| digest.strip_prefix("sha256:").unwrap_or(digest).to_string();
    let layer_paths: Vec<PathBuf> = oci_manifest
        .layers
        .iter()
        .map(|d| workdir.path().join("blobs/sha256").join(hex_of(&d.digest)))
        .collect();
    let layers = extract_layers(&layer_paths, &config.rootfs.diff_ids, workdir.path())?;

    info!(
        id = oci_manifest.config.digest,
        manifest_digest,
        layers = layers.len(),
        "loaded OCI archive"
    );
    Ok(LoadedImage::from_parts(
        oci_manifest.config.digest,
        manifest_digest,
        config.history,
        layers,
        Some(workdir),
    ))
}

async fn load_from_daemon(input: &str) -> Result<LoadedImage> {
    let export_dir = TempDir::new()?;
    let tar_path = export_dir.path().join("export.tar");
    let output = tokio::process::Command::new("docker")
        .arg("save")
        .arg(input)
        .arg("-o")
        .arg(&tar_path)
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::ImageLoad {
            input: input.to_string(),
            reason: format!(
                "docker save failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    load_docker_archive(&tar_path)
}

async fn load_from_registry(input: &str, credential: Option<&Credential>) -> Result<LoadedImage> {
    let reference: Reference = input.parse().map_err(|e| Error::ImageLoad {
        input: input.to_string(),
        reason: format!("invalid image reference: {e}"),
    })?;
    let auth = match credential {
        Some(cred) => RegistryAuth::Basic(cred.username.clone(), cred.password.clone()),
        None => RegistryAuth::Anonymous,
    };

    let client = RegistryClient::new(ClientConfig {
        platform_resolver: Some(Box::new(linux_amd64_resolver)),
        ..Default::default()
    });
    let image_data = client
        .pull(
            &reference,
            &auth,
            vec![
                manifest::IMAGE_LAYER_MEDIA_TYPE,
                manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
                manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
            ],
        )
        .await
        .map_err(|e| Error::ImageLoad {
            input: input.to_string(),
            reason: format!("registry pull failed: {e}"),
        })?;

    let manifest_digest = image_data.digest.clone().ok_or_else(|| Error::ImageLoad {
        input: input.to_string(),
        reason: "registry did not return a manifest digest".into(),
    })?;
    let config_bytes = image_data.config.data.clone();
    let id = format!("sha256:{}", sha256_hex(&config_bytes));
    let config: ImageConfig =
        serde_json::from_slice(&config_bytes).map_err(|e| Error::ImageLoad {
            input: input.to_string(),
            reason: format!("malformed image config: {e}"),
        })?;

    // Spill pulled blobs to disk so extraction shares the archive path.
    let workdir = TempDir::new()?;
    let mut layer_paths = Vec::with_capacity(image_data.layers.len());
    for (i, layer) in image_data.layers.iter().enumerate() {
        let blob_path = workdir.path().join(format!("blob-{i}"));
        fs::write(&blob_path, &layer.data)?;
        layer_paths.push(blob_path);
    }
    let layers = extract_layers(&layer_paths, &config.rootfs.diff_ids, workdir.path())?;

    info!(id, manifest_digest, layers = layers.len(), "pulled image from registry");
    Ok(LoadedImage::from_parts(
        id,
        manifest_digest,
        config.history,
        layers,
        Some(workdir),
    ))
}

fn extract_layers(
    layer_paths: &[PathBuf],
    diff_ids: &[String],
    workdir: &Path,
) -> Result<Vec<LayerArchive>> {
    if layer_paths.len() != diff_ids.len() {
        return Err(Error::LayersGeneration(format!(
            "config lists {} diff ids but the archive carries {} layers",
            diff_ids.len(),
            layer_paths.len()
        )));
    }
    let mut layers = Vec::with_capacity(layer_paths.len());
    for (i, (path, diff_id)) in layer_paths.iter().zip(diff_ids).enumerate() {
        let extract_dir = workdir.join(format!("extracted-{i}"));
        fs::create_dir_all(&extract_dir)?;
        layers.push(read_layer_archive(path, diff_id, &extract_dir)?);
    }
    Ok(layers)
}

/// Walk one layer tar, spilling regular files to `extract_dir` and
/// recording whiteout and opaque-directory markers instead of extracting
/// them. Extracted files get opaque on-disk names; the image path lives in
/// the [`LayerFile`] record, which keeps hostile archive paths inert.
fn read_layer_archive(path: &Path, diff_id: &str, extract_dir: &Path) -> Result<LayerArchive> {
    let reader = open_maybe_gzip(path)?;
    let mut archive = tar::Archive::new(reader);

    let mut files = Vec::new();
    let mut whiteouts = Vec::new();
    let mut opaque_dirs = Vec::new();
    let mut total_size = 0u64;

    for (seq, entry) in archive.entries()?.enumerate() {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let Some(raw_path) = entry.path()?.to_str().map(str::to_string) else {
            continue;
        };
        let image_path = normalize_image_path(&raw_path);
        let (parent, name) = split_parent(&image_path);

        if name == OPAQUE_MARKER {
            opaque_dirs.push(parent.to_string());
            continue;
        }
        if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
            whiteouts.push(join_image_path(parent, victim));
            continue;
        }

        let size = entry.header().size()?;
        total_size += size;
        let disk_path = extract_dir.join(format!("f{seq}"));
        let mut out = File::create(&disk_path)?;
        io::copy(&mut entry, &mut out)?;
        files.push(LayerFile {
            path: image_path,
            size,
            disk_path,
        });
    }

    Ok(LayerArchive {
        digest: diff_id.to_string(),
        size: total_size,
        files,
        whiteouts,
        opaque_dirs,
    })
}

fn normalize_image_path(raw: &str) -> String {
    let trimmed = raw.trim_start_matches("./").trim_start_matches('/');
    format!("/{trimmed}")
}

fn split_parent(image_path: &str) -> (&str, &str) {
    match image_path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", image_path),
    }
}

fn join_image_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn layer_reading_records_files_and_markers() {
        let dir = tempfile::tempdir().unwrap();
        let layer_tar = tar_with(&[
            ("bin/sh", b"#!"),
            ("etc/.wh.shadow", b""),
            ("var/lib/.wh..wh..opq", b""),
        ]);
        let tar_path = dir.path().join("layer.tar");
        File::create(&tar_path)
            .unwrap()
            .write_all(&layer_tar)
            .unwrap();
        let extract = dir.path().join("out");
        fs::create_dir_all(&extract).unwrap();

        let layer = read_layer_archive(&tar_path, "sha256:abc", &extract).unwrap();
        assert_eq!(layer.digest, "sha256:abc");
        assert_eq!(layer.files.len(), 1);
        assert_eq!(layer.files[0].path, "/bin/sh");
        assert_eq!(layer.size, 2);
        assert_eq!(layer.whiteouts, vec!["/etc/shadow".to_string()]);
        assert_eq!(layer.opaque_dirs, vec!["/var/lib".to_string()]);
        assert!(layer.files[0].disk_path.is_file());
    }

    #[test]
    fn gzipped_layers_are_transparently_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let layer_tar = tar_with(&[("app", b"data")]);
        let tar_path = dir.path().join("layer.tar.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(File::create(&tar_path).unwrap(), Default::default());
        encoder.write_all(&layer_tar).unwrap();
        encoder.finish().unwrap();
        let extract = dir.path().join("out");
        fs::create_dir_all(&extract).unwrap();

        let layer = read_layer_archive(&tar_path, "sha256:def", &extract).unwrap();
        assert_eq!(layer.files[0].path, "/app");
        assert_eq!(fs::read(&layer.files[0].disk_path).unwrap(), b"data");
    }

    #[test]
    fn layer_count_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_layers(&[], &["sha256:abc".to_string()], dir.path()).unwrap_err();
        assert!(matches!(err, Error::LayersGeneration(_)));
    }
}

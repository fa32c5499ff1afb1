//! Input classification: figure out where an image reference points before
//! committing to a load strategy.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::errors::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `docker save` tarball with a top-level `manifest.json`.
    DockerArchive,
    /// OCI image layout tarball with a top-level `oci-layout`.
    OciArchive,
    /// Image resolvable through a local Docker daemon.
    DockerDaemon,
    /// Remote registry reference.
    Registry,
}

/// Registry credentials in `username:password` form.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Accepts `username[:password]`. The split is on the first colon only,
    /// registry passwords may contain colons; without one the whole input
    /// is the username and the password is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let (username, password) = raw.split_once(':').unwrap_or((raw, ""));
        if username.is_empty() {
            return Err(Error::Config("credential username is empty".into()));
        }
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Decide how to load `input`.
///
/// Existing files are sniffed by their tar contents. Non-file inputs go to
/// the daemon when one is reachable, otherwise straight to the registry.
pub fn detect_source(input: &str, bypass_docker_daemon: bool) -> Result<SourceKind> {
    let path = Path::new(input);
    if path.is_file() {
        return sniff_archive(path);
    }
    if !bypass_docker_daemon && daemon_available() {
        return Ok(SourceKind::DockerDaemon);
    }
    Ok(SourceKind::Registry)
}

pub fn daemon_available() -> bool {
    std::env::var_os("DOCKER_HOST").is_some() || Path::new("/var/run/docker.sock").exists()
}

/// Distinguish docker-archive from oci-archive by the top-level entries of
/// the (possibly gzipped) tarball.
fn sniff_archive(path: &Path) -> Result<SourceKind> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    let file = File::open(path)?;

    let reader: Box<dyn Read> = if n == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    let mut saw_manifest = false;
    for entry in archive.entries()? {
        let entry = entry?;
        let entry_path = entry.path()?;
        let Some(name) = entry_path.to_str() else {
            continue;
        };
        let name = name.trim_start_matches("./");
        match name {
            "oci-layout" => return Ok(SourceKind::OciArchive),
            "manifest.json" => saw_manifest = true,
            _ => {}
        }
    }
    if saw_manifest {
        return Ok(SourceKind::DockerArchive);
    }
    Err(Error::ImageLoad {
        input: path.display().to_string(),
        reason: "archive is neither a docker save nor an OCI layout tarball".into(),
    })
}

//! Bundle provisioning for the local engine
//!
//! A bundle is an archive of server config files and user-defined function
//! definitions. Bundles are downloaded once into a content-addressed cache
//! (`<cache>/<sha256(reference)>`) and extracted into the working dir.

use crate::core::record::Vars;
use crate::engine::EngineError;
use crate::execution::template::render_str;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use url::Url;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fetch and extract every bundle into `working_dir`
///
/// References are rendered as templates with `vars` before use; the cache
/// key is computed from the unrendered reference.
pub async fn provision_bundles(
    bundles: &[String],
    cache_dir: &Path,
    working_dir: &Path,
    vars: &Vars,
) -> Result<(), EngineError> {
    if bundles.is_empty() {
        return Ok(());
    }

    tokio::fs::create_dir_all(cache_dir).await?;

    for reference in bundles {
        let bundle_err = |reason: String| EngineError::Bundle {
            reference: reference.clone(),
            reason,
        };

        let rendered = render_str(reference, vars).map_err(|e| bundle_err(e.to_string()))?;
        let local = cache_dir.join(sha256_hex(reference.as_bytes()));

        debug!(source = %rendered, path = %local.display(), "fetching bundle");
        cached_fetch(&rendered, &local)
            .await
            .map_err(|e| bundle_err(e.to_string()))?;

        debug!(path = %local.display(), "extracting bundle");
        let archive = local.clone();
        let dest = working_dir.to_path_buf();
        tokio::task::spawn_blocking(move || extract_bundle(&archive, &dest))
            .await
            .map_err(|e| bundle_err(e.to_string()))?
            .map_err(|e| bundle_err(e.to_string()))?;
    }

    Ok(())
}

/// Copy `source` to `dest` unless `dest` exists and the reference carries no
/// `#disable-cache=true` fragment
async fn cached_fetch(source: &str, dest: &Path) -> Result<(), EngineError> {
    let (location, disable_cache) = split_cache_flag(source);

    if !disable_cache && tokio::fs::try_exists(dest).await? {
        debug!(path = %dest.display(), "bundle cache hit");
        return Ok(());
    }

    let bytes = if location.starts_with("http://") || location.starts_with("https://") {
        let response = reqwest::get(location).await?.error_for_status()?;
        response.bytes().await?.to_vec()
    } else if location.starts_with("file://") {
        let path = Url::parse(location)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| EngineError::Config(format!("invalid file url '{}'", location)))?;
        tokio::fs::read(path).await?
    } else {
        tokio::fs::read(location).await?
    };

    let parent = dest
        .parent()
        .ok_or_else(|| EngineError::Config(format!("invalid cache path {}", dest.display())))?
        .to_path_buf();
    let dest = dest.to_path_buf();

    // Write to a temp file next to the target so readers never see a partial bundle
    tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(&dest).map_err(|e| EngineError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;

    Ok(())
}

/// `location#disable-cache=true` -> (`location`, true)
fn split_cache_flag(source: &str) -> (&str, bool) {
    match source.split_once('#') {
        Some((location, fragment)) => {
            let disable = url::form_urlencoded::parse(fragment.as_bytes())
                .any(|(k, v)| k == "disable-cache" && matches!(v.as_ref(), "1" | "true" | "TRUE" | "True" | "t"));
            (location, disable)
        }
        None => (source, false),
    }
}

/// Extract a `.tar` or `.tar.gz` archive; non-archive files are left alone
pub fn extract_bundle(archive: &Path, working_dir: &Path) -> Result<(), EngineError> {
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if read == 2 && magic == GZIP_MAGIC {
        unpack(tar::Archive::new(GzDecoder::new(file)), working_dir)
    } else if is_tar(&mut file)? {
        unpack(tar::Archive::new(file), working_dir)
    } else {
        debug!(path = %archive.display(), "bundle is not an archive, skipping extraction");
        Ok(())
    }
}

fn is_tar(file: &mut File) -> Result<bool, EngineError> {
    let mut header = [0u8; 262];
    let read = file.read(&mut header)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(read == header.len() && &header[257..262] == b"ustar")
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, working_dir: &Path) -> Result<(), EngineError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path()?.into_owned();
        let Some(dest) = bundle_destination(working_dir, &name) else {
            continue;
        };

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

/// Where an archive member lands in the working dir, if anywhere
///
/// - `etc/clickhouse-server/*` -> `<working_dir>/*`
/// - `var/lib/clickhouse/user_defined/*` -> `<working_dir>/user_defined/*`
/// - `var/lib/clickhouse/user_scripts/*` -> `<working_dir>/user_scripts/*`
pub fn bundle_destination(working_dir: &Path, name_in_archive: &Path) -> Option<PathBuf> {
    let normalized: PathBuf = name_in_archive
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();

    let file_name = normalized.file_name()?;
    let parent = normalized.parent()?;

    if parent == Path::new("etc/clickhouse-server") {
        Some(working_dir.join(file_name))
    } else if parent == Path::new("var/lib/clickhouse/user_defined") {
        Some(working_dir.join("user_defined").join(file_name))
    } else if parent == Path::new("var/lib/clickhouse/user_scripts") {
        Some(working_dir.join("user_scripts").join(file_name))
    } else {
        None
    }
}

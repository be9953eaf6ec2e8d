//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Zi.
//! The Zi project belongs to the Dunimd project team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! # Plugin Package Archives
//!
//! Subprocess plugins ship as a zip container holding a `manifest.json` and
//! exactly one entry point named `main` (or `main.exe`) at any depth.
//!
//! Extraction writes into a freshly created private working directory and
//! rejects every entry whose name would resolve outside of it, whether
//! through `..` segments, absolute paths or drive prefixes.

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::errors::{Result, ZiError};
use crate::orbit::manifest::ZiManifest;

pub const MANIFEST_FILE: &str = "manifest.json";
const EXECUTABLE_NAMES: [&str; 2] = ["main", "main.exe"];

fn open_archive(bin: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(bin))
        .map_err(|e| ZiError::validation(format!("failed to open archive: {}", e)))
}

fn base_name(entry: &str) -> Option<&str> {
    entry.trim_end_matches('/').rsplit(['/', '\\']).next()
}

fn is_executable_entry(entry: &str) -> bool {
    !entry.ends_with('/')
        && base_name(entry).map_or(false, |base| EXECUTABLE_NAMES.contains(&base))
}

/// Raw bytes of the first `manifest.json` found at any depth.
pub fn read_manifest_bytes(bin: &[u8]) -> Result<Vec<u8>> {
    let mut archive = open_archive(bin)?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() || base_name(file.name()) != Some(MANIFEST_FILE) {
            continue;
        }
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| ZiError::validation(format!("failed to read manifest: {}", e)))?;
        return Ok(data);
    }
    Err(ZiError::validation("manifest.json not found in plugin archive"))
}

/// Require exactly one `main` / `main.exe` entry, returning its stored name.
pub fn ensure_executable_present(bin: &[u8]) -> Result<String> {
    let archive = open_archive(bin)?;
    let mut found: Vec<&str> = archive.file_names().filter(|n| is_executable_entry(n)).collect();
    match found.len() {
        0 => Err(ZiError::validation("plugin archive missing main executable")),
        1 => Ok(found.remove(0).to_string()),
        _ => {
            found.sort_unstable();
            Err(ZiError::validation(format!(
                "plugin archive has more than one main executable: {}",
                found.join(", ")
            )))
        }
    }
}

/// Validate a subprocess plugin package and return its manifest.
///
/// Manifest and executable checks are independent so the error names exactly
/// what is wrong with the archive.
pub fn validate_package(bin: &[u8]) -> Result<ZiManifest> {
    let manifest = ZiManifest::parse(&read_manifest_bytes(bin)?)?;
    ensure_executable_present(bin)?;
    Ok(manifest)
}

/// Lexically join `name` onto `base`, refusing anything that leaves `base`.
///
/// The returned path is always `base` followed by at least one normal
/// component. Names that normalise to `base` itself are rejected as well.
pub fn join_within(base: &Path, name: &str) -> Result<PathBuf> {
    let escape = || {
        ZiError::security(format!(
            "archive entry '{}' escapes extraction directory",
            name
        ))
    };

    let mut relative = PathBuf::new();
    let mut depth = 0usize;
    for part in name.split(['/', '\\']) {
        for component in Path::new(part).components() {
            match component {
                Component::Normal(segment) => {
                    relative.push(segment);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(escape());
                    }
                    relative.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    // Leading separators show up as empty parts, so a root
                    // here is only reachable through a drive or UNC prefix.
                    return Err(escape());
                }
            }
        }
    }

    if name.starts_with('/') || name.starts_with('\\') {
        return Err(escape());
    }
    if depth == 0 {
        return Err(escape());
    }
    Ok(base.join(relative))
}

/// Create a uniquely named private working directory under `root`.
///
/// On Unix the directory is readable by its owner only (`0o700`).
pub fn create_workdir(root: &Path, prefix: &str) -> Result<PathBuf> {
    fs::create_dir_all(root)?;
    let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(root)?;
    Ok(dir.keep())
}

/// Extract every archive entry into `workdir`, returning the executable path.
///
/// Any failing entry aborts the whole extraction. The caller owns `workdir`
/// and is responsible for removing it when this returns an error.
pub fn extract_into(bin: &[u8], workdir: &Path) -> Result<PathBuf> {
    let mut archive = open_archive(bin)?;
    let mut executable: Option<PathBuf> = None;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();

        if file.is_dir() {
            match join_within(workdir, &name) {
                Ok(target) => fs::create_dir_all(&target)?,
                // A bare "./" directory entry names the working dir itself.
                Err(_) if name.split(['/', '\\']).all(|p| p.is_empty() || p == ".") => {}
                Err(e) => return Err(e),
            }
            continue;
        }

        let target = join_within(workdir, &name)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let is_main = is_executable_entry(&name);
        let mut out = File::create(&target)?;
        io::copy(&mut file, &mut out)?;
        drop(out);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut mode = file.unix_mode().map(|m| m & 0o777).unwrap_or(0o644);
            if is_main && mode & 0o111 == 0 {
                mode |= 0o755;
            }
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }

        if is_main && executable.is_none() {
            executable = Some(target);
        }
    }

    executable.ok_or_else(|| ZiError::internal("extracted archive missing main executable"))
}

/// Extract into a fresh working directory under `root`.
///
/// Returns `(workdir, executable)`. On failure the partial directory is
/// removed before the error is returned.
pub fn extract(bin: &[u8], root: &Path, prefix: &str) -> Result<(PathBuf, PathBuf)> {
    let workdir = create_workdir(root, prefix)?;
    match extract_into(bin, &workdir) {
        Ok(executable) => Ok((workdir, executable)),
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&workdir) {
                log::warn!(
                    "orbit.archive.cleanup_failed: failed to remove partial working directory - path={}, error={}",
                    workdir.to_string_lossy(),
                    cleanup
                );
            }
            Err(e)
        }
    }
}

/// BLAKE3 fingerprint of an archive, used to tell loaded binaries apart.
pub fn digest(bin: &[u8]) -> String {
    blake3::hash(bin).to_hex().to_string()
}

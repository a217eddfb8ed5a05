//! Pulling the client executable out of a release archive.
//!
//! Extraction writes to a path we choose, never to a path taken from the
//! archive, and reads every entry so a truncated archive fails here instead
//! of producing a half-written executable.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

/// Archive formats frp publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn from_ext(ext: &str) -> Self {
        if ext == "zip" { Self::Zip } else { Self::TarGz }
    }
}

/// Why an archive could not produce the executable.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("no member named {0}")]
    MemberNotFound(String),

    #[error("more than one member named {0}")]
    AmbiguousMember(String),

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn member_matches(member: &Path, exe_name: &str) -> bool {
    member
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == exe_name)
}

/// Extract the single member named `exe_name` into `dest_dir`.
///
/// Returns the path of the extracted file (`dest_dir/exe_name`).
pub fn extract_member(
    archive: &Path,
    kind: ArchiveKind,
    exe_name: &str,
    dest_dir: &Path,
) -> Result<PathBuf, ExtractError> {
    let dest = dest_dir.join(exe_name);
    let found = match kind {
        ArchiveKind::TarGz => extract_tar_gz(archive, exe_name, &dest)?,
        ArchiveKind::Zip => extract_zip(archive, exe_name, &dest)?,
    };
    match found {
        0 => Err(ExtractError::MemberNotFound(exe_name.to_string())),
        1 => Ok(dest),
        _ => Err(ExtractError::AmbiguousMember(exe_name.to_string())),
    }
}

fn extract_tar_gz(archive: &Path, exe_name: &str, dest: &Path) -> Result<usize, ExtractError> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut found = 0;
    for entry in tar.entries()? {
        let mut entry = entry.map_err(|e| ExtractError::Corrupt(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| ExtractError::Corrupt(e.to_string()))?
            .into_owned();
        if member_matches(&path, exe_name) {
            found += 1;
            if found == 1 {
                let mut out = File::create(dest)?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| ExtractError::Corrupt(e.to_string()))?;
                out.sync_all()?;
            }
        } else {
            // Drain so a truncated tail is detected.
            io::copy(&mut entry, &mut io::sink())
                .map_err(|e| ExtractError::Corrupt(e.to_string()))?;
        }
    }
    Ok(found)
}

fn extract_zip(archive: &Path, exe_name: &str, dest: &Path) -> Result<usize, ExtractError> {
    let file = File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| ExtractError::Corrupt(e.to_string()))?;
    let mut found = 0;
    for i in 0..zip.len() {
        let mut member = zip
            .by_index(i)
            .map_err(|e| ExtractError::Corrupt(e.to_string()))?;
        if !member.is_file() || !member_matches(Path::new(member.name()), exe_name) {
            continue;
        }
        found += 1;
        if found == 1 {
            let mut out = File::create(dest)?;
            io::copy(&mut member, &mut out).map_err(|e| ExtractError::Corrupt(e.to_string()))?;
            out.sync_all()?;
        }
    }
    Ok(found)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    /// Build an in-memory `.tar.gz` with the given `(path, contents)` members.
    pub(crate) fn tar_gz(members: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extracts_nested_member() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("frp.tar.gz");
        std::fs::write(
            &archive,
            tar_gz(&[
                ("frp_0.61.1_linux_amd64/LICENSE", b"license"),
                ("frp_0.61.1_linux_amd64/frpc", b"#!/bin/sh\n"),
                ("frp_0.61.1_linux_amd64/frpc.toml", b"serverAddr = \"x\""),
                ("frp_0.61.1_linux_amd64/frps", b"server"),
            ]),
        )
        .unwrap();

        let out = tempfile::tempdir().unwrap();
        let path = extract_member(&archive, ArchiveKind::TarGz, "frpc", out.path()).unwrap();
        assert_eq!(path, out.path().join("frpc"));
        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn missing_member_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("frp.tar.gz");
        std::fs::write(&archive, tar_gz(&[("frp/frps", b"server")])).unwrap();

        let out = tempfile::tempdir().unwrap();
        let err = extract_member(&archive, ArchiveKind::TarGz, "frpc", out.path()).unwrap_err();
        assert!(matches!(err, ExtractError::MemberNotFound(_)));
    }

    #[test]
    fn duplicate_member_is_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("frp.tar.gz");
        std::fs::write(&archive, tar_gz(&[("a/frpc", b"1"), ("b/frpc", b"2")])).unwrap();

        let out = tempfile::tempdir().unwrap();
        let err = extract_member(&archive, ArchiveKind::TarGz, "frpc", out.path()).unwrap_err();
        assert!(matches!(err, ExtractError::AmbiguousMember(_)));
    }

    #[test]
    fn truncated_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("frp.tar.gz");
        let full = tar_gz(&[("frp/frpc", &[7u8; 4096]), ("frp/frps", &[9u8; 4096])]);
        std::fs::write(&archive, &full[..full.len() / 2]).unwrap();

        let out = tempfile::tempdir().unwrap();
        assert!(extract_member(&archive, ArchiveKind::TarGz, "frpc", out.path()).is_err());
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(ArchiveKind::from_ext("zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::from_ext("tar.gz"), ArchiveKind::TarGz);
    }
}

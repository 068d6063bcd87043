//! Tar stage: archive a job directory for upload.

use std::path::Path;

use flate2::write::GzEncoder;
use tracing::debug;

use crate::config::Compression;
use crate::error::{Result, SubmitError};

/// Archive `dir` into `dest`, returning the archive size in bytes.
///
/// The directory's own name becomes the archive's root entry so remote
/// decompression reproduces the layout.
pub fn archive_directory(dir: &Path, dest: &Path, compression: Compression) -> Result<u64> {
    if !dir.is_dir() {
        return Err(SubmitError::transfer(
            dir.display().to_string(),
            "archive source is not a directory",
        ));
    }
    let root = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "job".to_string());

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(dest)?;

    match compression {
        Compression::Gzip => {
            let encoder = GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(&root, dir)?;
            builder.into_inner()?.finish()?;
        }
        Compression::None => {
            let mut builder = tar::Builder::new(file);
            builder.append_dir_all(&root, dir)?;
            builder.into_inner()?;
        }
    }

    let size = std::fs::metadata(dest)?.len();
    debug!("archived {:?} -> {:?} ({} bytes)", dir, dest, size);
    Ok(size)
}

/// File extension for a compression mode.
pub fn archive_extension(compression: Compression) -> &'static str {
    match compression {
        Compression::Gzip => "tar.gz",
        Compression::None => "tar",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn case_dir(root: &TempDir) -> std::path::PathBuf {
        let dir = root.path().join("case_a");
        std::fs::create_dir_all(dir.join("mesh")).unwrap();
        std::fs::write(dir.join("model.inp"), b"*HEADING\n").unwrap();
        std::fs::write(dir.join("mesh/coarse.msh"), vec![0u8; 512]).unwrap();
        dir
    }

    fn entry_names<R: Read>(archive: &mut tar::Archive<R>) -> Vec<String> {
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_gzip_archive_roundtrip() {
        let root = TempDir::new().unwrap();
        let dir = case_dir(&root);
        let dest = root.path().join("case_a.tar.gz");

        let size = archive_directory(&dir, &dest, Compression::Gzip).unwrap();
        assert!(size > 0);

        let decoder = GzDecoder::new(std::fs::File::open(&dest).unwrap());
        let mut archive = tar::Archive::new(decoder);
        let names = entry_names(&mut archive);
        assert!(names.contains(&"case_a/model.inp".to_string()));
        assert!(names.contains(&"case_a/mesh/coarse.msh".to_string()));
    }

    #[test]
    fn test_plain_archive() {
        let root = TempDir::new().unwrap();
        let dir = case_dir(&root);
        let dest = root.path().join("case_a.tar");

        archive_directory(&dir, &dest, Compression::None).unwrap();
        let mut archive = tar::Archive::new(std::fs::File::open(&dest).unwrap());
        let names = entry_names(&mut archive);
        assert!(names.iter().any(|n| n.starts_with("case_a/")));
    }

    #[test]
    fn test_missing_directory_fails() {
        let root = TempDir::new().unwrap();
        let err = archive_directory(
            &root.path().join("nope"),
            &root.path().join("out.tar"),
            Compression::Gzip,
        )
        .unwrap_err();
        assert!(matches!(err, SubmitError::Transfer { .. }));
    }
}

//! Gzip tar packing for the single-stream upload variant.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::Builder;

use crate::transport::TransportError;

/// Packs every local path into one gzip tar stream. Each path lands under its
/// base name at the archive root.
pub(crate) fn pack(locals: &[Utf8PathBuf]) -> Result<Vec<u8>, TransportError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(true);

    for local in locals {
        let name = local.file_name().ok_or_else(|| TransportError::Transfer {
            message: format!("cannot pack {local}: path has no file name"),
        })?;
        let metadata = fs::metadata(local).map_err(|err| io_error(local, &err))?;
        if metadata.is_dir() {
            builder
                .append_dir_all(name, local)
                .map_err(|err| io_error(local, &err))?;
        } else {
            builder
                .append_path_with_name(local, name)
                .map_err(|err| io_error(local, &err))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| pack_error(&err))?;
    encoder.finish().map_err(|err| pack_error(&err))
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

fn pack_error(err: &std::io::Error) -> TransportError {
    TransportError::Transfer {
        message: format!("failed to finish archive: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use flate2::read::GzDecoder;
    use tar::Archive;
    use tempfile::TempDir;

    #[test]
    fn packs_files_and_directories_under_their_base_names() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("utf8: {}", path.display()));
        fs::create_dir_all(root.join("cookbooks/app")).unwrap_or_else(|err| panic!("mkdir: {err}"));
        fs::write(root.join("cookbooks/app/recipe.rb"), "package 'x'")
            .unwrap_or_else(|err| panic!("write: {err}"));
        fs::write(root.join("dna.json"), "{}").unwrap_or_else(|err| panic!("write: {err}"));

        let bytes = pack(&[root.join("cookbooks"), root.join("dna.json")])
            .unwrap_or_else(|err| panic!("pack: {err}"));

        let mut archive = Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut files = Vec::new();
        for entry in archive.entries().unwrap_or_else(|err| panic!("entries: {err}")) {
            let mut entry = entry.unwrap_or_else(|err| panic!("entry: {err}"));
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry
                .path()
                .unwrap_or_else(|err| panic!("path: {err}"))
                .to_string_lossy()
                .into_owned();
            let mut contents = String::new();
            entry
                .read_to_string(&mut contents)
                .unwrap_or_else(|err| panic!("read: {err}"));
            files.push((path, contents));
        }
        files.sort();

        assert_eq!(
            files,
            vec![
                ("cookbooks/app/recipe.rb".to_owned(), "package 'x'".to_owned()),
                ("dna.json".to_owned(), "{}".to_owned()),
            ]
        );
    }
}

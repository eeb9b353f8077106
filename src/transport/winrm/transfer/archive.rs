//! Zips directories before they are streamed to a Windows host.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::transport::TransportError;

/// Returns `true` when `path` was written with a trailing separator, which
/// asks for the directory contents without the directory itself.
#[must_use]
pub(crate) fn wants_flatten(path: &Utf8Path) -> bool {
    path.as_str().ends_with('/') || path.as_str().ends_with('\\')
}

/// Zips `dir` into a temporary archive. Entry names are prefixed with the
/// directory's base name unless `flatten` is set. Timestamps are pinned so
/// identical trees produce identical archives.
pub(crate) fn zip_directory(dir: &Utf8Path, flatten: bool) -> Result<NamedTempFile, TransportError> {
    let mut archive = tempfile::Builder::new()
        .prefix("galley-")
        .suffix(".zip")
        .tempfile()
        .map_err(|err| io_error(dir, &err))?;

    let prefix = if flatten {
        Utf8PathBuf::new()
    } else {
        Utf8PathBuf::from(dir.file_name().unwrap_or("archive"))
    };

    let mut writer = ZipWriter::new(archive.as_file_mut());
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());
    add_tree(&mut writer, dir, &prefix, options)?;
    writer.finish().map_err(|err| zip_error(dir, &err))?;
    Ok(archive)
}

fn add_tree<W>(
    writer: &mut ZipWriter<W>,
    dir: &Utf8Path,
    prefix: &Utf8Path,
    options: SimpleFileOptions,
) -> Result<(), TransportError>
where
    W: Write + std::io::Seek,
{
    let mut entries = dir
        .read_dir_utf8()
        .map_err(|err| io_error(dir, &err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| io_error(dir, &err))?;
    entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));

    if entries.is_empty() && !prefix.as_str().is_empty() {
        writer
            .add_directory(entry_name(prefix), options)
            .map_err(|err| zip_error(dir, &err))?;
    }

    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        let metadata = fs::metadata(path).map_err(|err| io_error(path, &err))?;
        if metadata.is_dir() {
            add_tree(writer, path, &name, options)?;
            continue;
        }
        let contents = fs::read(path).map_err(|err| io_error(path, &err))?;
        writer
            .start_file(entry_name(&name), options)
            .map_err(|err| zip_error(path, &err))?;
        writer
            .write_all(&contents)
            .map_err(|err| io_error(path, &err))?;
    }
    Ok(())
}

fn entry_name(path: &Utf8Path) -> String {
    path.components()
        .map(|component| component.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

fn zip_error(path: &Utf8Path, err: &zip::result::ZipError) -> TransportError {
    TransportError::Transfer {
        message: format!("failed to zip {path}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use tempfile::TempDir;
    use zip::ZipArchive;

    fn tree() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("site"))
            .unwrap_or_else(|path| panic!("utf8: {}", path.display()));
        fs::create_dir_all(root.join("css")).unwrap_or_else(|err| panic!("mkdir: {err}"));
        fs::write(root.join("index.html"), "<html/>").unwrap_or_else(|err| panic!("write: {err}"));
        fs::write(root.join("css/app.css"), "body{}").unwrap_or_else(|err| panic!("write: {err}"));
        (tmp, root)
    }

    fn names(archive: &NamedTempFile) -> Vec<String> {
        let file = archive.reopen().unwrap_or_else(|err| panic!("reopen: {err}"));
        let mut zip = ZipArchive::new(file).unwrap_or_else(|err| panic!("zip: {err}"));
        let mut names = Vec::new();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).unwrap_or_else(|err| panic!("entry: {err}"));
            let mut sink = Vec::new();
            entry
                .read_to_end(&mut sink)
                .unwrap_or_else(|err| panic!("read: {err}"));
            names.push(entry.name().to_owned());
        }
        names
    }

    #[test]
    fn base_name_prefixes_entries() {
        let (_tmp, root) = tree();
        let archive = zip_directory(&root, false).unwrap_or_else(|err| panic!("zip: {err}"));
        assert_eq!(names(&archive), vec!["site/css/app.css", "site/index.html"]);
    }

    #[test]
    fn trailing_separator_flattens_entries() {
        let (_tmp, root) = tree();
        let with_slash = Utf8PathBuf::from(format!("{root}/"));
        assert!(wants_flatten(&with_slash));
        let archive =
            zip_directory(&with_slash, true).unwrap_or_else(|err| panic!("zip: {err}"));
        assert_eq!(names(&archive), vec!["css/app.css", "index.html"]);
    }

    #[test]
    fn identical_trees_produce_identical_archives() {
        let (_tmp, root) = tree();
        let first = zip_directory(&root, false).unwrap_or_else(|err| panic!("zip: {err}"));
        let second = zip_directory(&root, false).unwrap_or_else(|err| panic!("zip: {err}"));
        let first_bytes = fs::read(first.path()).unwrap_or_else(|err| panic!("read: {err}"));
        let second_bytes = fs::read(second.path()).unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(first_bytes, second_bytes);
    }
}

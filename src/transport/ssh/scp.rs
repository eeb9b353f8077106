//! SCP sink protocol stream builder.
//!
//! The stream is fed to `scp -t` on the remote side. Files are announced with
//! a `C` record followed by their contents and a NUL byte; directories open
//! with a `D` record before their children and close with `E`.

use std::fs;

use camino::Utf8Path;

use crate::transport::TransportError;

/// Builds the sink stream for `path`, announcing it under `name`.
pub(crate) fn scp_stream(path: &Utf8Path, name: &str) -> Result<Vec<u8>, TransportError> {
    let mut stream = Vec::new();
    push_entry(&mut stream, path, name)?;
    Ok(stream)
}

/// Returns `true` when `path` must be sent with `scp -r`.
pub(crate) fn needs_recursion(path: &Utf8Path) -> Result<bool, TransportError> {
    fs::metadata(path)
        .map(|metadata| metadata.is_dir())
        .map_err(|err| io_error(path, &err))
}

fn push_entry(stream: &mut Vec<u8>, path: &Utf8Path, name: &str) -> Result<(), TransportError> {
    let metadata = fs::metadata(path).map_err(|err| io_error(path, &err))?;
    let mode = permission_bits(&metadata);

    if metadata.is_dir() {
        stream.extend_from_slice(format!("D{mode:04o} 0 {name}\n").as_bytes());
        let mut children = path
            .read_dir_utf8()
            .map_err(|err| io_error(path, &err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| io_error(path, &err))?;
        children.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        for child in children {
            push_entry(stream, child.path(), child.file_name())?;
        }
        stream.extend_from_slice(b"E\n");
        return Ok(());
    }

    let contents = fs::read(path).map_err(|err| io_error(path, &err))?;
    stream.extend_from_slice(format!("C{mode:04o} {} {name}\n", contents.len()).as_bytes());
    stream.extend_from_slice(&contents);
    stream.push(0);
    Ok(())
}

#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { 0o644 }
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

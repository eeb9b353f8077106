//! Idempotent file transfer over a WinRM command shell.
//!
//! A transfer runs in four phases:
//!
//! 1. hash every input locally, zipping directories first;
//! 2. ask the host which destinations are missing or differ;
//! 3. stream only the dirty entries as Base64 chunks into temp files;
//! 4. decode (and unzip) the temp files server-side and verify digests.
//!
//! Temporary archives are removed when the transfer returns, whether it
//! succeeded or not.

mod archive;
mod report;
pub mod scripts;

use std::collections::BTreeMap;
use std::fs;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::executor::CommandExecutor;
use super::shell::ShellOutput;
use crate::transport::TransportError;
use report::{column, flag, parse_csv};
use scripts::{DecodeTarget, check_script, decode_script};

/// Streaming command lines stay strictly shorter than this many characters.
pub const MAX_ENCODED_WRITE: usize = 8000;

/// Remote staging directory for streamed content.
pub const REMOTE_STAGING_DIR: &str = r"%TEMP%\galley-upload";

/// Outcome for one uploaded input.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferEntry {
    /// SHA-256 of the file, or of the zipped directory.
    pub digest: String,
    /// Local input path.
    pub source: Utf8PathBuf,
    /// Remote file the content is written to.
    pub destination: String,
    /// Remote directory an archive is expanded into.
    pub archive_target: Option<String>,
    /// Whether the remote copy was missing or different.
    pub dirty: bool,
    /// `echo` commands issued for this entry.
    pub chunks: u64,
    /// Raw bytes streamed for this entry.
    pub bytes: u64,
}

/// Per-entry summary returned by [`FileTransporter::upload`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransferReport {
    /// Entries ordered by source path.
    pub entries: Vec<TransferEntry>,
}

impl TransferReport {
    /// Raw bytes streamed across every entry.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.entries.iter().map(|entry| entry.bytes).sum()
    }

    /// Chunks streamed across every entry.
    #[must_use]
    pub fn chunks_sent(&self) -> u64 {
        self.entries.iter().map(|entry| entry.chunks).sum()
    }

    /// Entries that had to be transferred.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.dirty).count()
    }
}

/// Content staged once and written to every destination that needs it.
#[derive(Debug)]
struct Pending {
    digest: String,
    upload_path: Utf8PathBuf,
    entries: Vec<TransferEntry>,
}

impl Pending {
    fn staging_path(&self) -> String {
        format!("{REMOTE_STAGING_DIR}\\{}.b64", self.digest)
    }

    fn is_dirty(&self) -> bool {
        self.entries.iter().any(|entry| entry.dirty)
    }

    fn dirty_entries(&self) -> impl Iterator<Item = &TransferEntry> {
        self.entries.iter().filter(|entry| entry.dirty)
    }
}

type Plan = BTreeMap<String, Pending>;

/// Uploads files through a [`CommandExecutor`].
#[derive(Debug)]
pub struct FileTransporter<'a> {
    executor: &'a CommandExecutor,
}

impl<'a> FileTransporter<'a> {
    /// Creates a transporter using an opened executor.
    #[must_use]
    pub const fn new(executor: &'a CommandExecutor) -> Self {
        Self { executor }
    }

    /// Uploads `locals` into the `remote` directory, skipping content the
    /// host already has.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Transfer`] when a script fails or a decoded
    /// digest does not match, and shell errors from the executor.
    pub async fn upload(
        &self,
        locals: &[Utf8PathBuf],
        remote: &str,
    ) -> Result<TransferReport, TransportError> {
        let owned = locals.to_vec();
        let target = remote.to_owned();
        let (mut plan, archives) = tokio::task::spawn_blocking(move || prepare(&owned, &target))
            .await
            .map_err(|err| TransportError::Transfer {
                message: format!("hashing task failed: {err}"),
            })??;

        let result = self.transfer(&mut plan).await;
        drop(archives);
        result?;

        let mut entries: Vec<TransferEntry> = plan
            .into_values()
            .flat_map(|pending| pending.entries)
            .collect();
        entries.sort_by(|a, b| a.source.cmp(&b.source));
        let report = TransferReport { entries };
        info!(
            files = report.entries.len(),
            dirty = report.dirty_count(),
            bytes = report.bytes_sent(),
            chunks = report.chunks_sent(),
            "upload complete"
        );
        Ok(report)
    }

    async fn transfer(&self, plan: &mut Plan) -> Result<(), TransportError> {
        self.check(plan).await?;
        self.stream(plan).await?;
        self.decode(plan).await
    }

    async fn check(&self, plan: &mut Plan) -> Result<(), TransportError> {
        let hashes: BTreeMap<String, String> = plan
            .values()
            .flat_map(|pending| &pending.entries)
            .map(|entry| (entry.destination.clone(), entry.digest.clone()))
            .collect();
        let output = self
            .executor
            .run_powershell_script(&check_script(&hashes))
            .await?;
        ensure_success(&output, "check")?;

        for row in parse_csv(&output.stdout)? {
            let digest = column(&row, "src_digest")?;
            let destination = column(&row, "dst")?;
            let dirty = flag(&row, "chk_dirty")?;
            let Some(pending) = plan.get_mut(digest) else {
                continue;
            };
            for entry in pending
                .entries
                .iter_mut()
                .filter(|entry| entry.destination == destination)
            {
                entry.dirty = dirty;
            }
        }
        Ok(())
    }

    async fn stream(&self, plan: &mut Plan) -> Result<(), TransportError> {
        for pending in plan.values_mut().filter(|pending| pending.is_dirty()) {
            let staging = pending.staging_path();
            let prepare = format!(
                "if not exist \"{REMOTE_STAGING_DIR}\" mkdir \"{REMOTE_STAGING_DIR}\" & type nul > \"{staging}\""
            );
            let output = self.executor.run_cmd(&prepare, &[]).await?;
            ensure_success(&output, "stream")?;

            let contents = tokio::fs::read(&pending.upload_path)
                .await
                .map_err(|err| TransportError::Io {
                    path: pending.upload_path.to_string(),
                    message: err.to_string(),
                })?;
            let encoded = STANDARD.encode(&contents);
            let chunk_len = chunk_len_for(&staging);
            debug!(
                digest = %pending.digest,
                destinations = pending.dirty_entries().count(),
                bytes = contents.len(),
                chunk_len,
                "streaming dirty content"
            );

            let mut chunks = 0_u64;
            for chunk in encoded.as_bytes().chunks(chunk_len) {
                let chunk = String::from_utf8_lossy(chunk);
                let command = format!("echo {chunk} >> \"{staging}\"");
                let output = self.executor.run_cmd(&command, &[]).await?;
                ensure_success(&output, "stream")?;
                chunks += 1;
            }
            // The content crosses the wire once; charge it to the first
            // destination that needed it.
            if let Some(entry) = pending.entries.iter_mut().find(|entry| entry.dirty) {
                entry.chunks = chunks;
                entry.bytes = contents.len() as u64;
            }
        }
        Ok(())
    }

    async fn decode(&self, plan: &mut Plan) -> Result<(), TransportError> {
        let files: BTreeMap<String, Vec<DecodeTarget>> = plan
            .values()
            .filter(|pending| pending.is_dirty())
            .map(|pending| (pending.staging_path(), decode_targets(pending)))
            .collect();
        if files.is_empty() {
            return Ok(());
        }

        let output = self
            .executor
            .run_powershell_script(&decode_script(&files))
            .await?;
        ensure_success(&output, "decode")?;

        let decoded: BTreeMap<(String, String), String> = parse_csv(&output.stdout)?
            .iter()
            .map(|row| {
                Ok((
                    (column(row, "src")?.to_owned(), column(row, "dst")?.to_owned()),
                    column(row, "dst_digest")?.to_owned(),
                ))
            })
            .collect::<Result<_, TransportError>>()?;

        for pending in plan.values() {
            let staging = pending.staging_path();
            for entry in pending.dirty_entries() {
                match decoded.get(&(staging.clone(), entry.destination.clone())) {
                    Some(digest) if digest.eq_ignore_ascii_case(&entry.digest) => {}
                    Some(digest) => {
                        return Err(TransportError::Transfer {
                            message: format!(
                                "digest mismatch for {}: local {} remote {digest}",
                                entry.source, entry.digest
                            ),
                        });
                    }
                    None => {
                        return Err(TransportError::Transfer {
                            message: format!("decode report omitted {}", entry.source),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn prepare(
    locals: &[Utf8PathBuf],
    remote: &str,
) -> Result<(Plan, Vec<NamedTempFile>), TransportError> {
    let mut plan = Plan::new();
    let mut archives = Vec::new();
    let remote = remote.trim_end_matches(['\\', '/']);

    for local in locals {
        let metadata = fs::metadata(local).map_err(|err| io_error(local, &err))?;
        let (entry, upload_path) = if metadata.is_dir() {
            let archive = archive::zip_directory(local, archive::wants_flatten(local))?;
            let upload_path = Utf8PathBuf::from_path_buf(archive.path().to_path_buf()).map_err(
                |path| TransportError::Io {
                    path: path.display().to_string(),
                    message: "temporary archive path is not UTF-8".to_owned(),
                },
            )?;
            archives.push(archive);
            let digest = digest_file(&upload_path)?;
            let entry = TransferEntry {
                destination: format!("{REMOTE_STAGING_DIR}\\{digest}.zip"),
                archive_target: Some(remote.to_owned()),
                digest,
                source: local.clone(),
                dirty: true,
                chunks: 0,
                bytes: 0,
            };
            (entry, upload_path)
        } else {
            let name = local.file_name().ok_or_else(|| TransportError::Transfer {
                message: format!("cannot upload {local}: path has no file name"),
            })?;
            let entry = TransferEntry {
                digest: digest_file(local)?,
                source: local.clone(),
                destination: format!("{remote}\\{name}"),
                archive_target: None,
                dirty: true,
                chunks: 0,
                bytes: 0,
            };
            (entry, local.clone())
        };

        let pending = plan
            .entry(entry.digest.clone())
            .or_insert_with(|| Pending {
                digest: entry.digest.clone(),
                upload_path,
                entries: Vec::new(),
            });
        if !pending.entries.is_empty() {
            debug!(source = %entry.source, "content already staged for another input");
        }
        pending.entries.push(entry);
    }
    Ok((plan, archives))
}

/// Decode targets for the dirty entries of `pending`, one per destination.
fn decode_targets(pending: &Pending) -> Vec<DecodeTarget> {
    let mut targets: Vec<DecodeTarget> = Vec::new();
    for entry in pending.dirty_entries() {
        if targets.iter().any(|target| target.dst == entry.destination) {
            continue;
        }
        targets.push(DecodeTarget {
            dst: entry.destination.clone(),
            target: entry.archive_target.clone(),
        });
    }
    targets
}

fn digest_file(path: &Utf8Path) -> Result<String, TransportError> {
    let contents = fs::read(path).map_err(|err| io_error(path, &err))?;
    Ok(hex_digest(&contents))
}

/// Lower-case hex SHA-256 of `bytes`.
#[must_use]
pub fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Largest Base64 chunk, in characters, that keeps
/// `echo <chunk> >> "<staging>"` below [`MAX_ENCODED_WRITE`]. The result is
/// a multiple of four so chunks concatenate into valid Base64.
#[must_use]
pub fn chunk_len_for(staging: &str) -> usize {
    let overhead = format!("echo  >> \"{staging}\"").len();
    let available = MAX_ENCODED_WRITE.saturating_sub(overhead + 1);
    (available & !3).max(4)
}

fn ensure_success(output: &ShellOutput, phase: &str) -> Result<(), TransportError> {
    if output.is_success() {
        return Ok(());
    }
    Err(TransportError::Transfer {
        message: format!(
            "{phase} phase exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        ),
    })
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

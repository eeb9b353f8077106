//! PowerShell scripts driving the check and decode phases.
//!
//! Each script starts with a marker comment and carries its input as a JSON
//! document inside a single-quoted here-string, so no value needs PowerShell
//! escaping. Paths may contain `%VAR%` references; the scripts expand them
//! server-side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Marker on the first line of the check script.
pub const CHECK_MARKER: &str = "# galley:check-files";

/// Marker on the first line of the decode script.
pub const DECODE_MARKER: &str = "# galley:decode-files";

/// Header of the check report.
pub const CHECK_COLUMNS: [&str; 5] = ["src_digest", "dst", "chk_exists", "chk_dirty", "verifies"];

/// Header of the decode report.
pub const DECODE_COLUMNS: [&str; 4] = ["src", "dst", "target", "dst_digest"];

/// Decode instruction for one streamed temp file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DecodeTarget {
    /// Where the decoded bytes are written.
    pub dst: String,
    /// Directory an archive is expanded into, for zipped directories.
    pub target: Option<String>,
}

/// Builds the check script for destination -> digest pairs.
#[must_use]
pub fn check_script(hashes: &BTreeMap<String, String>) -> String {
    let payload = serde_json::to_string(hashes).unwrap_or_else(|_| "{}".to_owned());
    format!(
        r#"{CHECK_MARKER}
$ProgressPreference = 'SilentlyContinue'
$hashes = @'
{payload}
'@ | ConvertFrom-Json
$hashes.PSObject.Properties | ForEach-Object {{
  $dst = [Environment]::ExpandEnvironmentVariables($_.Name)
  $expected = $_.Value
  $exists = Test-Path -LiteralPath $dst -PathType Leaf
  $dirty = $true
  if ($exists) {{
    $actual = (Get-FileHash -Algorithm SHA256 -LiteralPath $dst).Hash.ToLower()
    $dirty = $actual -ne $expected
  }}
  New-Object psobject -Property @{{
    src_digest = $expected
    dst = $_.Name
    chk_exists = $exists
    chk_dirty = $dirty
    verifies = -not $dirty
  }}
}} | Select-Object src_digest, dst, chk_exists, chk_dirty, verifies | ConvertTo-Csv -NoTypeInformation
"#
    )
}

/// Builds the decode script for temp path -> destinations pairs. Each
/// staging file is decoded once and written to every destination listed
/// for it.
#[must_use]
pub fn decode_script(files: &BTreeMap<String, Vec<DecodeTarget>>) -> String {
    let payload = serde_json::to_string(files).unwrap_or_else(|_| "{}".to_owned());
    format!(
        r#"{DECODE_MARKER}
$ProgressPreference = 'SilentlyContinue'
$ErrorActionPreference = 'Stop'
$files = @'
{payload}
'@ | ConvertFrom-Json
function Ensure-Directory($path) {{
  if (-not (Test-Path -LiteralPath $path)) {{
    New-Item -ItemType Directory -Force -Path $path | Out-Null
  }}
}}
$files.PSObject.Properties | ForEach-Object {{
  $src = $_.Name
  $tmp = [Environment]::ExpandEnvironmentVariables($src)
  $bytes = [System.Convert]::FromBase64String([IO.File]::ReadAllText($tmp))
  foreach ($item in @($_.Value)) {{
    $dst = [Environment]::ExpandEnvironmentVariables($item.dst)
    Ensure-Directory (Split-Path -Parent $dst)
    [IO.File]::WriteAllBytes($dst, $bytes)
    $target = $item.target
    if ($target) {{
      $root = [Environment]::ExpandEnvironmentVariables($target)
      Ensure-Directory $root
      Add-Type -AssemblyName System.IO.Compression.FileSystem
      $archive = [System.IO.Compression.ZipFile]::OpenRead($dst)
      try {{
        foreach ($entry in $archive.Entries) {{
          $out = Join-Path $root $entry.FullName
          if ($entry.FullName.EndsWith('/')) {{
            Ensure-Directory $out
            continue
          }}
          Ensure-Directory (Split-Path -Parent $out)
          [System.IO.Compression.ZipFileExtensions]::ExtractToFile($entry, $out, $true)
        }}
      }} finally {{
        $archive.Dispose()
      }}
    }}
    New-Object psobject -Property @{{
      src = $src
      dst = $item.dst
      target = $target
      dst_digest = (Get-FileHash -Algorithm SHA256 -LiteralPath $dst).Hash.ToLower()
    }}
  }}
  Remove-Item -LiteralPath $tmp -Force
}} | Select-Object src, dst, target, dst_digest | ConvertTo-Csv -NoTypeInformation
"#
    )
}

/// Extracts the JSON payload embedded in a check or decode script.
#[must_use]
pub fn embedded_payload(script: &str) -> Option<&str> {
    let (_, rest) = script.split_once("@'\n")?;
    let (payload, _) = rest.split_once("\n'@")?;
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_script_embeds_destinations_and_digests() {
        let mut hashes = BTreeMap::new();
        hashes.insert(r"C:\galley\run.ps1".to_owned(), "ab12".to_owned());

        let script = check_script(&hashes);

        assert!(script.starts_with(CHECK_MARKER));
        assert_eq!(
            embedded_payload(&script),
            Some(r#"{"C:\\galley\\run.ps1":"ab12"}"#)
        );
        assert!(script.contains("src_digest, dst, chk_exists, chk_dirty, verifies"));
    }

    #[test]
    fn decode_payload_round_trips_through_json() {
        let mut files = BTreeMap::new();
        files.insert(
            r"%TEMP%\galley-upload\ab12.b64".to_owned(),
            vec![
                DecodeTarget {
                    dst: r"%TEMP%\galley-upload\ab12.zip".to_owned(),
                    target: Some(r"C:\galley".to_owned()),
                },
                DecodeTarget {
                    dst: r"C:\galley\copy.zip".to_owned(),
                    target: None,
                },
            ],
        );

        let script = decode_script(&files);
        let payload = embedded_payload(&script).unwrap_or_else(|| panic!("payload missing"));
        let parsed: BTreeMap<String, Vec<DecodeTarget>> =
            serde_json::from_str(payload).unwrap_or_else(|err| panic!("json: {err}"));

        assert!(script.starts_with(DECODE_MARKER));
        assert_eq!(parsed, files);
    }
}

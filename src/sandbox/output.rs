//! Shaping captured stdout/stderr into the single `output` string.

use std::path::Path;

use tokio::io::AsyncReadExt;

/// Separator placed before the stderr section of merged output.
pub const STDERR_MARKER: &str = "\nSTDERR:\n";

/// Appended when merged output exceeds the policy's byte limit.
pub const TRUNCATION_MARKER: &str = "\n... [OUTPUT TRUNCATED]";

/// Bytes read past the limit so lossy decoding of the kept prefix never
/// depends on where the read stopped (a UTF-8 char is at most 4 bytes).
const READ_SLACK: u64 = 4;

/// Reads at most `limit` bytes (plus slack) of a capture file, replacing
/// invalid UTF-8 instead of failing.
///
/// Bytes beyond the limit could never survive truncation, so they are not
/// loaded into memory at all.
pub async fn read_capture(path: &Path, limit: usize) -> std::io::Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut bytes = Vec::new();
    file.take(limit as u64 + READ_SLACK)
        .read_to_end(&mut bytes)
        .await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// stdout, then the stderr section if there is any.
pub fn merge(stdout: &str, stderr: &str) -> String {
    let mut output = String::with_capacity(stdout.len() + stderr.len() + STDERR_MARKER.len());
    output.push_str(stdout);
    if !stderr.is_empty() {
        output.push_str(STDERR_MARKER);
        output.push_str(stderr);
    }
    output
}

/// Cuts `output` to at most `max_bytes` and appends [`TRUNCATION_MARKER`].
///
/// The cut lands on the last char boundary at or before `max_bytes`, so
/// ASCII output keeps exactly `max_bytes` bytes.
pub fn truncate(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }

    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}

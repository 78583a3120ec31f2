use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use super::client::SshClient;

/// Chunk size for remote writes. Base64 text, so every chunk is shell-safe.
const CHUNK_SIZE: usize = 64 * 1024;

/// Split a payload into base64 chunks of at most `CHUNK_SIZE` characters.
pub fn chunk_payload(payload: &[u8]) -> Vec<String> {
    let encoded = BASE64.encode(payload);
    encoded
        .as_bytes()
        .chunks(CHUNK_SIZE)
        // chunks of an ASCII string split on byte boundaries stay valid
        .map(|c| String::from_utf8(c.to_vec()).expect("base64 is ascii"))
        .collect()
}

/// Upload `payload` to `remote_path` (mode 600) through the shell: base64
/// chunks appended to a temp file, decoded server-side, moved into place
/// atomically. Uploading the same payload twice yields identical remote
/// bytes; the temp file is removed on success and on failure.
pub async fn upload(client: &SshClient, remote_path: &str, payload: &[u8]) -> Result<()> {
    let tmp = format!("{}.upload", remote_path);
    let part = format!("{}.part", remote_path);

    if let Some(dir) = remote_path.rsplit_once('/').map(|(d, _)| d) {
        if !dir.is_empty() {
            client
                .execute(&format!("mkdir -p {}", dir))
                .await
                .with_context(|| format!("Failed to create remote directory {}", dir))?;
        }
    }

    let chunks = chunk_payload(payload);
    debug!(
        "uploading {} bytes to {}:{} in {} chunk(s)",
        payload.len(),
        client.host(),
        remote_path,
        chunks.len()
    );

    let result = write_chunks(client, &tmp, &part, remote_path, &chunks).await;

    // Best-effort temp cleanup either way.
    let _ = client.execute(&format!("rm -f {} {}", tmp, part)).await;

    result
}

async fn write_chunks(
    client: &SshClient,
    tmp: &str,
    part: &str,
    remote_path: &str,
    chunks: &[String],
) -> Result<()> {
    // First chunk truncates, the rest append.
    if chunks.is_empty() {
        client
            .execute(&format!(": > {}", tmp))
            .await
            .context("Failed to create remote temp file")?;
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let redirect = if i == 0 { ">" } else { ">>" };
        client
            .execute(&format!("printf '%s' '{}' {} {}", chunk, redirect, tmp))
            .await
            .with_context(|| format!("Failed to upload chunk {}/{}", i + 1, chunks.len()))?;
    }

    client
        .execute(&format!(
            "base64 -d {} > {} && mv {} {} && chmod 600 {}",
            tmp, part, part, remote_path, remote_path
        ))
        .await
        .with_context(|| format!("Failed to finalize upload to {}", remote_path))?;

    Ok(())
}

/// Download a remote file as bytes via base64 on the wire.
pub async fn download(client: &SshClient, remote_path: &str) -> Result<Vec<u8>> {
    let encoded = client
        .execute(&format!("base64 {}", remote_path))
        .await
        .with_context(|| format!("Failed to read remote file {}", remote_path))?;
    let stripped: String = encoded.split_whitespace().collect();
    BASE64
        .decode(stripped.as_bytes())
        .with_context(|| format!("Remote file {} was not valid base64 output", remote_path))
}

//! Multipart upload of job outputs.
//!
//! Parts are a fixed 100 MiB. The reader is consumed one part ahead by a
//! single byte: reading `part + 1` bytes tells us whether this part is the
//! last without a separate length probe, and the surplus byte is carried into
//! the next part. Part PUTs run concurrently under a semaphore of five; the
//! first failure cancels the rest and the whole upload is aborted best-effort.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{GatewayClient, GatewayError};

/// Fixed part size of 100 MiB.
pub const PART_SIZE: usize = 100 * 1024 * 1024;

/// Concurrent part PUTs per upload.
const MAX_CONCURRENT_PARTS: usize = 5;

/// Session descriptor handed out by the gateway when an upload starts.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSession {
    /// Object-store upload identifier.
    pub upload_id: String,

    /// Bucket the object lands in.
    pub app_bucket_id: i64,

    /// Server-side deduplicated object name. Field name matches the wire.
    #[serde(rename = "uniqified_filename")]
    pub uniquified_filename: String,
}

/// Upload a byte stream as a job output and return the bucket object id.
///
/// The session is created lazily on the first part so that zero-RTT failures
/// (unreadable source) never allocate anything remotely.
///
/// # Errors
///
/// Returns the first error from reading, part upload, or completion. When a
/// session was already allocated, a best-effort abort is issued before the
/// error surfaces.
pub async fn upload<R>(
    client: &GatewayClient,
    filename: &str,
    mut stream: R,
    is_log_file: bool,
) -> Result<i64, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut session: Option<UploadSession> = None;

    match upload_parts(client, filename, &mut stream, &mut session).await {
        Ok(parts) => {
            let session = session.expect("at least one part allocates a session");
            complete(client, &session, parts, is_log_file).await
        },
        Err(err) => {
            if let Some(session) = &session {
                abort(client, session).await;
            }
            Err(err)
        },
    }
}

/// Drive the read-dispatch loop, returning the collected `(part, etag)` pairs.
async fn upload_parts<R>(
    client: &GatewayClient,
    filename: &str,
    stream: &mut R,
    session: &mut Option<UploadSession>,
) -> Result<Vec<(u32, String)>, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let parts: Arc<Mutex<Vec<(u32, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PARTS));
    let cancel = CancellationToken::new();
    let mut workers = JoinSet::new();

    let mut carry: Option<u8> = None;
    let mut part_number: u32 = 0;
    let mut first_error: Option<GatewayError> = None;

    loop {
        part_number += 1;

        let mut data = read_part(stream, PART_SIZE + 1, carry.take()).await?;
        let last = data.len() <= PART_SIZE;
        if !last {
            carry = data.pop();
        }

        if session.is_none() {
            *session = Some(create_session(client, filename).await?);
        }
        let current = session.as_ref().expect("session created above");

        let put_url = part_url(client, current, part_number).await?;

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        if cancel.is_cancelled() {
            break;
        }

        workers.spawn(put_part(
            client.clone(),
            put_url,
            data,
            part_number,
            Arc::clone(&parts),
            cancel.clone(),
            permit,
        ));

        if last {
            break;
        }
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {},
            Ok(Err(err)) => {
                cancel.cancel();
                first_error.get_or_insert(err);
            },
            Err(join_err) => {
                cancel.cancel();
                first_error.get_or_insert(GatewayError::Io {
                    path: filename.to_string(),
                    source: std::io::Error::other(join_err),
                });
            },
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    let mut parts = Arc::try_unwrap(parts)
        .expect("all workers joined")
        .into_inner();
    parts.sort_by_key(|(number, _)| *number);
    Ok(parts)
}

/// Read up to `target` bytes, prepending a carried byte from the previous
/// read-ahead. Stops early only at end of stream.
async fn read_part<R>(
    stream: &mut R,
    target: usize,
    carry: Option<u8>,
) -> Result<Vec<u8>, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::with_capacity(target.min(1 << 20));
    if let Some(byte) = carry {
        data.push(byte);
    }

    let mut buf = vec![0u8; 1 << 20];
    while data.len() < target {
        let want = buf.len().min(target - data.len());
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(|source| GatewayError::Io {
                path: "upload stream".to_string(),
                source,
            })?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }

    Ok(data)
}

async fn put_part(
    client: GatewayClient,
    put_url: String,
    data: Vec<u8>,
    part_number: u32,
    parts: Arc<Mutex<Vec<(u32, String)>>>,
    cancel: CancellationToken,
    _permit: tokio::sync::OwnedSemaphorePermit,
) -> Result<(), GatewayError> {
    if cancel.is_cancelled() {
        return Ok(());
    }

    let send = client.send_with_retry(
        client
            .http
            .put(&put_url)
            .header("Content-Type", "application/octet-stream")
            .body(data),
        "multipart part PUT",
    );

    let resp = tokio::select! {
        resp = send => resp.inspect_err(|_| cancel.cancel())?,
        () = cancel.cancelled() => return Ok(()),
    };

    let etag = resp
        .headers()
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
        .ok_or(GatewayError::MissingEtag)
        .inspect_err(|_| cancel.cancel())?;

    parts.lock().await.push((part_number, etag));
    Ok(())
}

async fn create_session(
    client: &GatewayClient,
    filename: &str,
) -> Result<UploadSession, GatewayError> {
    let endpoint = "/multipart-upload-id";
    let resp = client
        .send_with_retry(
            client
                .request(Method::GET, endpoint)
                .query(&[("filename", filename)]),
            endpoint,
        )
        .await?;
    super::decode_json(resp, endpoint).await
}

async fn part_url(
    client: &GatewayClient,
    session: &UploadSession,
    part_number: u32,
) -> Result<String, GatewayError> {
    let endpoint = "/put-create-signed-url";
    let resp = client
        .send_with_retry(
            client.request(Method::GET, endpoint).query(&[
                ("app_bucket_id", session.app_bucket_id.to_string()),
                ("object_name", session.uniquified_filename.clone()),
                ("upload_id", session.upload_id.clone()),
                ("part_number", part_number.to_string()),
            ]),
            endpoint,
        )
        .await?;
    super::decode_json(resp, endpoint).await
}

async fn complete(
    client: &GatewayClient,
    session: &UploadSession,
    parts: Vec<(u32, String)>,
    is_log_file: bool,
) -> Result<i64, GatewayError> {
    validate_parts(&parts)?;

    let wire_parts: Vec<[String; 2]> = parts
        .into_iter()
        .map(|(number, etag)| [number.to_string(), etag])
        .collect();
    let parts_b64 = BASE64.encode(serde_json::to_vec(&wire_parts).unwrap_or_default());

    let endpoint = "/complete-create-multipart-upload";
    let resp = client
        .send_with_retry(
            client
                .request(Method::PUT, endpoint)
                .json(&serde_json::json!({
                    "app_bucket_id": session.app_bucket_id,
                    "filename": session.uniquified_filename,
                    "upload_id": session.upload_id,
                    "parts": parts_b64,
                    "is_log_file": is_log_file,
                })),
            endpoint,
        )
        .await?;
    super::decode_json(resp, endpoint).await
}

/// Best-effort abort; failures end up in the job log only.
async fn abort(client: &GatewayClient, session: &UploadSession) {
    let endpoint = "/abort-create-multipart-upload";
    let result = client
        .send_with_retry(
            client
                .request(Method::PUT, endpoint)
                .json(&serde_json::json!({
                    "app_bucket_id": session.app_bucket_id,
                    "filename": session.uniquified_filename,
                    "upload_id": session.upload_id,
                })),
            endpoint,
        )
        .await;
    if let Err(err) = result {
        tracing::warn!("error aborting multipart upload: {err}");
    }
}

/// The completed parts list must be exactly 1..=N with no gaps.
fn validate_parts(parts: &[(u32, String)]) -> Result<(), GatewayError> {
    for (index, (number, _)) in parts.iter().enumerate() {
        let expected = u32::try_from(index).unwrap_or(u32::MAX) + 1;
        if *number != expected {
            return Err(GatewayError::PartGap { expected });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_part_honors_carry_byte() {
        let mut stream: &[u8] = b"bcdef";
        let data = read_part(&mut stream, 4, Some(b'a')).await.unwrap();
        assert_eq!(data, b"abcd");
    }

    #[tokio::test]
    async fn test_read_part_stops_at_eof() {
        let mut stream: &[u8] = b"xy";
        let data = read_part(&mut stream, 10, None).await.unwrap();
        assert_eq!(data, b"xy");
    }

    #[tokio::test]
    async fn test_read_part_split_points() {
        // A stream of target+1 bytes means "not the last part": the surplus
        // byte rolls into the next read.
        let payload = vec![7u8; 9];
        let mut stream: &[u8] = &payload;

        let mut first = read_part(&mut stream, 5, None).await.unwrap();
        assert_eq!(first.len(), 5);
        let carry = first.pop();

        let second = read_part(&mut stream, 5, carry).await.unwrap();
        assert_eq!(first.len() + second.len(), 9);
    }

    #[test]
    fn test_validate_parts_accepts_contiguous() {
        let parts = vec![
            (1, "a".to_string()),
            (2, "b".to_string()),
            (3, "c".to_string()),
        ];
        assert!(validate_parts(&parts).is_ok());
    }

    #[test]
    fn test_validate_parts_rejects_gap() {
        let parts = vec![(1, "a".to_string()), (3, "c".to_string())];
        assert!(matches!(
            validate_parts(&parts),
            Err(GatewayError::PartGap { expected: 2 })
        ));
    }

    #[test]
    fn test_validate_parts_rejects_offset_start() {
        let parts = vec![(2, "b".to_string())];
        assert!(matches!(
            validate_parts(&parts),
            Err(GatewayError::PartGap { expected: 1 })
        ));
    }

    #[test]
    fn test_wire_parts_encoding() {
        let wire: Vec<[String; 2]> = vec![["1".to_string(), "etag-a".to_string()]];
        let encoded = BASE64.encode(serde_json::to_vec(&wire).unwrap());
        let decoded: Vec<[String; 2]> =
            serde_json::from_slice(&BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, wire);
    }
}

//! SFTP dispatch (§4.5, §4.9). Every handler here replies with the
//! originating `requestId` (§3 "For all SFTP requests `requestId` is
//! mandatory") except the chunked-upload trio, which correlates by
//! `uploadId` instead (§4.5.5) — the central dispatcher in `router::mod`
//! already screened out a missing `requestId` for every other `sftp:*` type
//! before routing here.

use crate::error::GatewayError;
use crate::models::{FileEntry, OutboundEnvelope};
use crate::router::require_session;
use crate::session::SessionHandle;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tokio::sync::mpsc::UnboundedSender;

#[tracing::instrument(level = "debug", skip(payload, session, tx), fields(request_id = request_id.as_deref().unwrap_or("")))]
pub async fn dispatch(
    kind: &str,
    payload: Value,
    request_id: Option<String>,
    session: &Option<Arc<SessionHandle>>,
    tx: &UnboundedSender<Message>,
) {
    match kind {
        "sftp:readdir" => simple(kind, session, tx, request_id, |h, path| h.sftp_readdir(path), payload, "path").await,
        "sftp:realpath" => simple(kind, session, tx, request_id, |h, path| h.sftp_realpath(path), payload, "path").await,
        "sftp:stat" => stat(session, tx, request_id, payload).await,
        "sftp:mkdir" => mkdir(session, tx, request_id, payload).await,
        "sftp:unlink" => unlink(session, tx, request_id, payload).await,
        "sftp:rmdir" => rmdir(session, tx, request_id, payload).await,
        "sftp:rename" => rename(session, tx, request_id, payload).await,
        "sftp:chmod" => chmod(session, tx, request_id, payload).await,
        "sftp:readfile" => readfile(session, tx, request_id, payload).await,
        "sftp:writefile" => writefile(session, tx, request_id, payload).await,
        "sftp:copy" => copy_or_move(session, tx, request_id, payload, true).await,
        "sftp:move" => copy_or_move(session, tx, request_id, payload, false).await,
        "sftp:upload:start" => upload_start(session, tx, payload).await,
        "sftp:upload:chunk" => upload_chunk(session, tx, payload).await,
        "sftp:upload:cancel" => upload_cancel(session, tx, payload),
        other => fail("sftp", request_id, tx, GatewayError::protocol(format!("unsupported sftp message type '{other}'"))),
    }
}

/// Attach `operation`/`session_id` to `err`, log it once via `GatewayError::log`,
/// and build the `sftp:{op}:error` reply from the same value (§7) instead of
/// formatting the failure a second time.
fn fail(op: &str, request_id: Option<String>, tx: &UnboundedSender<Message>, err: GatewayError) {
    let err = err.with_operation(op);
    err.log();
    send(
        tx,
        OutboundEnvelope::new(format!("sftp:{op}:error"))
            .with_payload(json!({"message": err.user_message()}))
            .with_request_id(request_id),
    );
}

fn reply_success(op: &str, request_id: Option<String>, tx: &UnboundedSender<Message>, payload: Value) {
    send(
        tx,
        OutboundEnvelope::new(format!("sftp:{op}:success")).with_payload(payload).with_request_id(request_id),
    );
}

fn send(tx: &UnboundedSender<Message>, envelope: OutboundEnvelope) {
    if let Ok(text) = serde_json::to_string(&envelope) {
        let _ = tx.send(Message::Text(text.into()));
    }
}

fn op_name(kind: &str) -> &str {
    kind.strip_prefix("sftp:").unwrap_or(kind)
}

/// Helper for the two single-path, single-future-value ops (`readdir`,
/// `realpath`) whose success payload is just their return value reserialized.
async fn simple<T, F, Fut>(kind: &str, session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, op: F, payload: Value, field: &str)
where
    T: serde::Serialize,
    F: FnOnce(Arc<SessionHandle>, String) -> Fut,
    Fut: std::future::Future<Output = Result<T, crate::error::GatewayError>>,
{
    let name = op_name(kind).to_string();
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail(&name, request_id, tx, e),
    };
    let Some(path) = payload.get(field).and_then(Value::as_str).map(str::to_string) else {
        return fail(&name, request_id, tx, GatewayError::precondition(format!("'{field}' is required")).with_session(handle.id));
    };
    match op(handle, path).await {
        Ok(value) => reply_success(&name, request_id, tx, json!(value)),
        Err(e) => fail(&name, request_id, tx, e.with_session(handle.id)),
    }
}

async fn stat(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("stat", request_id, tx, e),
    };
    let Some(path) = payload.get("path").and_then(Value::as_str).map(str::to_string) else {
        return fail("stat", request_id, tx, GatewayError::precondition("'path' is required").with_session(handle.id));
    };
    match handle.sftp_stat(path).await {
        Ok(entry) => reply_success("stat", request_id, tx, json!(entry)),
        Err(e) => fail("stat", request_id, tx, e.with_session(handle.id)),
    }
}

async fn mkdir(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("mkdir", request_id, tx, e),
    };
    let Some(path) = payload.get("path").and_then(Value::as_str).map(str::to_string) else {
        return fail("mkdir", request_id, tx, GatewayError::precondition("'path' is required").with_session(handle.id));
    };
    match handle.sftp_mkdir(path).await {
        Ok(entry) => reply_success("mkdir", request_id, tx, entry_payload(entry)),
        Err(e) => fail("mkdir", request_id, tx, e.with_session(handle.id)),
    }
}

async fn unlink(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("unlink", request_id, tx, e),
    };
    let Some(path) = payload.get("path").and_then(Value::as_str).map(str::to_string) else {
        return fail("unlink", request_id, tx, GatewayError::precondition("'path' is required").with_session(handle.id));
    };
    match handle.sftp_unlink(path).await {
        Ok(()) => reply_success("unlink", request_id, tx, Value::Null),
        Err(e) => fail("unlink", request_id, tx, e.with_session(handle.id)),
    }
}

async fn rmdir(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("rmdir", request_id, tx, e),
    };
    let Some(path) = payload.get("path").and_then(Value::as_str).map(str::to_string) else {
        return fail("rmdir", request_id, tx, GatewayError::precondition("'path' is required").with_session(handle.id));
    };
    match handle.sftp_rmdir(path).await {
        Ok(()) => reply_success("rmdir", request_id, tx, Value::Null),
        Err(e) => fail("rmdir", request_id, tx, e.with_session(handle.id)),
    }
}

async fn rename(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("rename", request_id, tx, e),
    };
    let (Some(old_path), Some(new_path)) = (
        payload.get("oldPath").and_then(Value::as_str).map(str::to_string),
        payload.get("newPath").and_then(Value::as_str).map(str::to_string),
    ) else {
        return fail("rename", request_id, tx, GatewayError::precondition("'oldPath' and 'newPath' are required").with_session(handle.id));
    };
    match handle.sftp_rename(old_path, new_path).await {
        Ok(entry) => reply_success("rename", request_id, tx, entry_payload(entry)),
        Err(e) => fail("rename", request_id, tx, e.with_session(handle.id)),
    }
}

async fn chmod(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("chmod", request_id, tx, e),
    };
    let Some(path) = payload.get("path").and_then(Value::as_str).map(str::to_string) else {
        return fail("chmod", request_id, tx, GatewayError::precondition("'path' is required").with_session(handle.id));
    };
    let Some(mode) = payload.get("mode").and_then(Value::as_u64) else {
        return fail("chmod", request_id, tx, GatewayError::precondition("'mode' is required").with_session(handle.id));
    };
    match handle.sftp_chmod(path, mode as u32).await {
        Ok(entry) => reply_success("chmod", request_id, tx, entry_payload(entry)),
        Err(e) => fail("chmod", request_id, tx, e.with_session(handle.id)),
    }
}

async fn readfile(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("readfile", request_id, tx, e),
    };
    let Some(path) = payload.get("path").and_then(Value::as_str).map(str::to_string) else {
        return fail("readfile", request_id, tx, GatewayError::precondition("'path' is required").with_session(handle.id));
    };
    match handle.sftp_readfile(path).await {
        Ok(content) => reply_success("readfile", request_id, tx, json!({"content": content})),
        Err(e) => fail("readfile", request_id, tx, e.with_session(handle.id)),
    }
}

async fn writefile(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail("writefile", request_id, tx, e),
    };
    let (Some(path), Some(content)) = (
        payload.get("path").and_then(Value::as_str).map(str::to_string),
        payload.get("content").and_then(Value::as_str).map(str::to_string),
    ) else {
        return fail("writefile", request_id, tx, GatewayError::precondition("'path' and 'content' are required").with_session(handle.id));
    };
    match handle.sftp_writefile(path, content).await {
        Ok(entry) => reply_success("writefile", request_id, tx, entry_payload(entry)),
        Err(e) => fail("writefile", request_id, tx, e.with_session(handle.id)),
    }
}

async fn copy_or_move(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, request_id: Option<String>, payload: Value, is_copy: bool) {
    let op = if is_copy { "copy" } else { "move" };
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return fail(op, request_id, tx, e),
    };
    let Some(sources) = payload.get("sources").and_then(Value::as_array).map(|arr| {
        arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>()
    }) else {
        return fail(op, request_id, tx, GatewayError::precondition("'sources' is required").with_session(handle.id));
    };
    let Some(destination) = payload.get("destination").and_then(Value::as_str).map(str::to_string) else {
        return fail(op, request_id, tx, GatewayError::precondition("'destination' is required").with_session(handle.id));
    };

    let result = if is_copy { handle.sftp_copy(sources, destination).await } else { handle.sftp_move(sources, destination).await };
    match result {
        Ok(entries) => reply_success(op, request_id, tx, json!(entries)),
        Err(e) => fail(op, request_id, tx, e.with_session(handle.id)),
    }
}

fn entry_payload(entry: Option<FileEntry>) -> Value {
    entry.map(|e| json!(e)).unwrap_or(Value::Null)
}

/// `upload:success` payload shape (§4.5.5 scenario 3: `payload.attrs.size`,
/// top-level `path`) — the entry's fields merged in alongside `uploadId` and
/// `path`, the same flat shape `writefile:success` already uses for `entry`.
fn upload_success_payload(upload_id: &str, remote_path: &str, entry: Option<FileEntry>) -> Value {
    let mut payload = match entry {
        Some(e) => json!(e),
        None => json!({}),
    };
    if let Value::Object(map) = &mut payload {
        map.insert("uploadId".to_string(), json!(upload_id));
        map.insert("path".to_string(), json!(remote_path));
    }
    payload
}

// ---- Chunked upload engine (§4.5.5) -----------------------------------------

async fn upload_start(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return upload_error(tx, upload_id_of(&payload), e),
    };
    let upload_id = upload_id_of(&payload);
    let Some(remote_path) = payload.get("remotePath").and_then(Value::as_str).map(str::to_string) else {
        return upload_error(tx, upload_id, GatewayError::precondition("'remotePath' is required").with_session(handle.id));
    };
    let Some(size) = payload.get("size").and_then(Value::as_u64) else {
        return upload_error(tx, upload_id, GatewayError::precondition("'size' is required").with_session(handle.id));
    };
    let relative_path = payload.get("relativePath").and_then(Value::as_str).map(str::to_string);

    match handle.upload_start(upload_id.clone(), remote_path.clone(), size, relative_path).await {
        Ok(crate::session::actor::UploadStartOutcome::Ready) => {
            send(tx, OutboundEnvelope::new("sftp:upload:ready").with_payload(json!({"uploadId": upload_id})));
        }
        Ok(crate::session::actor::UploadStartOutcome::CompletedEmpty(entry)) => {
            send(
                tx,
                OutboundEnvelope::new("sftp:upload:success").with_payload(upload_success_payload(&upload_id, &remote_path, entry)),
            );
        }
        Err(e) => upload_error(tx, upload_id, e.with_session(handle.id)),
    }
}

async fn upload_chunk(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, payload: Value) {
    let handle = match require_session(session) {
        Ok(h) => h.clone(),
        Err(e) => return upload_error(tx, upload_id_of(&payload), e),
    };
    let upload_id = upload_id_of(&payload);
    let Some(data_b64) = payload.get("data").and_then(Value::as_str) else {
        return upload_error(tx, upload_id, GatewayError::precondition("'data' is required").with_session(handle.id));
    };
    let data = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data_b64) {
        Ok(bytes) => bytes,
        Err(e) => return upload_error(tx, upload_id, GatewayError::protocol(format!("invalid base64 chunk: {e}")).with_session(handle.id)),
    };

    match handle.upload_chunk(upload_id.clone(), data).await {
        Ok(crate::session::actor::UploadChunkOutcome::Progress { bytes_written }) => {
            send(tx, OutboundEnvelope::new("sftp:upload:progress").with_payload(json!({"uploadId": upload_id, "bytesWritten": bytes_written})));
        }
        Ok(crate::session::actor::UploadChunkOutcome::Completed { remote_path, entry }) => {
            send(
                tx,
                OutboundEnvelope::new("sftp:upload:success").with_payload(upload_success_payload(&upload_id, &remote_path, entry)),
            );
        }
        Err(e) => upload_error(tx, upload_id, e.with_session(handle.id)),
    }
}

fn upload_cancel(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>, payload: Value) {
    let Some(handle) = session else { return };
    let upload_id = upload_id_of(&payload);
    handle.upload_cancel(upload_id.clone());
    send(tx, OutboundEnvelope::new("sftp:upload:cancelled").with_payload(json!({"uploadId": upload_id})));
}

fn upload_id_of(payload: &Value) -> String {
    payload.get("uploadId").and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Upload trio analogue of `fail`: correlates by `uploadId` instead of
/// `requestId` (§4.5.5), but still logs the one `GatewayError` value before
/// reducing it to the wire message.
fn upload_error(tx: &UnboundedSender<Message>, upload_id: String, err: GatewayError) {
    let err = err.with_operation("upload");
    err.log();
    send(
        tx,
        OutboundEnvelope::new("sftp:upload:error").with_payload(json!({"uploadId": upload_id, "message": err.user_message()})),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileAttrs;

    fn sample_entry(size: u64) -> FileEntry {
        FileEntry {
            filename: "b".to_string(),
            longname: "-rw-r--r--   1        0        0          3 b".to_string(),
            attrs: FileAttrs {
                size,
                uid: 0,
                gid: 0,
                mode: 0o644,
                atime: 0,
                mtime: 0,
                is_directory: false,
                is_file: true,
                is_symbolic_link: false,
            },
            owner: None,
        }
    }

    /// §4.5.5 scenario 3: a 3-byte upload completed over two chunks replies
    /// with a flat `path`/`attrs.size` payload, the same shape `writefile`
    /// uses for its `entry` — not nested under an `"entry"` key and not
    /// under the wrong field name `remotePath`.
    #[test]
    fn upload_success_payload_is_flat_like_writefile() {
        let payload = upload_success_payload("u1", "/tmp/b", Some(sample_entry(3)));
        assert_eq!(payload["uploadId"], "u1");
        assert_eq!(payload["path"], "/tmp/b");
        assert_eq!(payload["attrs"]["size"], 3);
        assert!(payload.get("remotePath").is_none());
        assert!(payload.get("entry").is_none());
    }

    /// A `size == 0` upload completes synchronously with no bytes ever
    /// written; the entry may still be `None` if the remote stat races the
    /// write, but `uploadId`/`path` must still be present at the top level.
    #[test]
    fn upload_success_payload_handles_missing_entry() {
        let payload = upload_success_payload("u2", "/tmp/empty", None);
        assert_eq!(payload["uploadId"], "u2");
        assert_eq!(payload["path"], "/tmp/empty");
    }
}

//! Pure helpers for the SFTP Service (C5, §4.5): attribute conversion,
//! encoding detection/decoding for `readfile`, and the `mkdir -p` helper.
//! These run on the session actor's OS thread alongside the `ssh2::Sftp`
//! handle they operate on (§5), so every function here is synchronous.

use crate::error::GatewayError;
use crate::models::{FileAttrs, FileEntry};
use std::path::Path;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const S_IFDIR: u32 = 0o040000;

/// Convert a native `ssh2::FileStat` plus its bare filename into the wire
/// shape of §4.5.1. `longname` is synthesized `ls -l` style, since ssh2-rs's
/// `readdir`/`lstat` do not surface the raw SFTP `longname` field libssh2
/// receives on the wire.
pub fn file_entry(filename: &str, stat: &ssh2::FileStat, owner: Option<String>) -> FileEntry {
    let mode = stat.perm.unwrap_or(0o644);
    let is_symlink = mode & S_IFMT == S_IFLNK;
    let is_dir = !is_symlink && (stat.is_dir() || mode & S_IFMT == S_IFDIR);
    let is_file = !is_symlink && !is_dir;

    let attrs = FileAttrs {
        size: stat.size.unwrap_or(0),
        uid: stat.uid.unwrap_or(0),
        gid: stat.gid.unwrap_or(0),
        mode,
        atime: stat.atime.unwrap_or(0) as i64 * 1000,
        mtime: stat.mtime.unwrap_or(0) as i64 * 1000,
        is_directory: is_dir,
        is_file,
        is_symbolic_link: is_symlink,
    };

    let kind = if attrs.is_symbolic_link { 'l' } else if attrs.is_directory { 'd' } else { '-' };
    let longname = format!(
        "{}{} {:>3} {:>8} {:>8} {:>10} {}",
        kind,
        permission_string(attrs.mode),
        1,
        attrs.uid,
        attrs.gid,
        attrs.size,
        filename,
    );
    FileEntry { filename: filename.to_string(), longname, attrs, owner }
}

fn permission_string(mode: u32) -> String {
    let bits = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    bits.iter().map(|(bit, ch)| if mode & bit != 0 { *ch } else { '-' }).collect()
}

/// Recursive directory creation (§4.5.6): try the equivalent of `mkdir -p`
/// by walking parents and creating iteratively, tolerating "already exists
/// as a directory" and failing hard on "already exists as a non-directory".
pub fn mkdir_p(sftp: &ssh2::Sftp, path: &Path) -> Result<(), GatewayError> {
    if path.as_os_str().is_empty() || path == Path::new("/") {
        return Ok(());
    }
    if let Ok(stat) = sftp.stat(path) {
        return if stat.is_dir() {
            Ok(())
        } else {
            Err(GatewayError::io(format!("{} already exists and is not a directory", path.display())))
        };
    }
    if let Some(parent) = path.parent() {
        mkdir_p(sftp, parent)?;
    }
    match sftp.mkdir(path, 0o755) {
        Ok(()) => Ok(()),
        Err(_) => match sftp.stat(path) {
            Ok(stat) if stat.is_dir() => Ok(()),
            Ok(_) => Err(GatewayError::io(format!("{} already exists and is not a directory", path.display()))),
            Err(e) => Err(GatewayError::io_src(format!("mkdir {} failed: {e}", path.display()), e)),
        },
    }
}

/// Decode the bytes of a remote file per the precedence in §4.5.2.
pub fn decode_file_contents(raw: &[u8]) -> Result<String, GatewayError> {
    let mut detector = chardetng::EncodingDetector::new();
    let is_ascii = detector.feed(raw, true);
    let guess = detector.guess(None, true);

    if is_ascii || guess == encoding_rs::UTF_8 {
        return String::from_utf8(raw.to_vec())
            .map_err(|e| GatewayError::io_src(format!("file is not valid utf-8: {e}"), e));
    }

    // chardetng does not surface a numeric confidence; `is_ascii` (pure
    // ASCII / definite UTF-8) is the only "certain" signal it gives us, so a
    // non-ASCII guess is treated as the §4.5.2 "confidence < 0.90" branch.
    let cjk_superset = [encoding_rs::GBK, encoding_rs::GB18030, encoding_rs::BIG5]
        .iter()
        .any(|enc| *enc == guess);

    if cjk_superset {
        return Ok(decode_with(encoding_rs::GB18030, raw));
    }

    let gb_attempt = decode_with(encoding_rs::GB18030, raw);
    if !gb_attempt.contains('\u{FFFD}') {
        return Ok(gb_attempt);
    }

    let guess_attempt = decode_with(guess, raw);
    if !guess_attempt.contains('\u{FFFD}') {
        return Ok(guess_attempt);
    }

    String::from_utf8(raw.to_vec()).or_else(|_| Ok(decode_with(encoding_rs::UTF_8, raw)))
}

fn decode_with(encoding: &'static encoding_rs::Encoding, raw: &[u8]) -> String {
    let (text, _, _) = encoding.decode(raw);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_ascii_as_utf8() {
        let text = decode_file_contents(b"hello world").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn decodes_valid_utf8_passthrough() {
        let raw = "héllo wörld".as_bytes();
        let text = decode_file_contents(raw).unwrap();
        assert_eq!(text, "héllo wörld");
    }

    #[test]
    fn decodes_gb18030_encoded_chinese_text() {
        let (raw, _, had_errors) = encoding_rs::GB18030.encode("你好世界");
        assert!(!had_errors);
        let text = decode_file_contents(&raw).unwrap();
        assert_eq!(text, "你好世界");
    }

    #[test]
    fn permission_string_renders_rwx_bits() {
        assert_eq!(permission_string(0o755), "rwxr-xr-x");
        assert_eq!(permission_string(0o644), "rw-r--r--");
    }
}

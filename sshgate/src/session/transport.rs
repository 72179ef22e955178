//! Transport Adapter (C2, §4.2). Establishes a ready `ssh2::Session` over an
//! optional SOCKS5/HTTP CONNECT proxy, given a decrypted `ConnectionSpec` and
//! a connect timeout. Grounded on the teacher's `ssh::connection::connect_with_timeout`
//! (TCP connect-with-timeout plus TCP keepalive tuning), generalized with the
//! proxy dispatch the teacher's jump-host-only connector did not need.

use crate::error::GatewayError;
use crate::models::{AuthMethod, ConnectionSpec, ProxyConfig};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Establish and authenticate an SSH session for `spec`, routed through
/// `spec.proxy` if present. Runs entirely on the calling (blocking) thread —
/// callers on the async side must invoke this inside `spawn_blocking` or, as
/// this crate does, from the session actor's dedicated OS thread.
pub fn connect(spec: &ConnectionSpec, timeout: Duration) -> Result<ssh2::Session, GatewayError> {
    let stream = match &spec.proxy {
        None => connect_direct(&spec.host, spec.port, timeout)?,
        Some(ProxyConfig::Socks5 { host, port, username, password }) => {
            let proxy_stream = connect_direct(host, *port, timeout)?;
            socks5_connect(proxy_stream, &spec.host, spec.port, username.as_deref(), password.as_deref())?
        }
        Some(ProxyConfig::HttpConnect { host, port, username, password }) => {
            let proxy_stream = connect_direct(host, *port, timeout)?;
            http_connect(proxy_stream, &spec.host, spec.port, username.as_deref(), password.as_deref(), timeout)?
        }
    };

    let mut session = ssh2::Session::new()
        .map_err(|e| GatewayError::transport_src(format!("failed to create ssh session: {e}"), e))?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(stream);
    session
        .handshake()
        .map_err(|e| GatewayError::transport_src(format!("ssh handshake failed: {e}"), e))?;

    authenticate(&mut session, spec)?;

    // Keepalive is only meaningful on live (non-test) connections; tests
    // construct sessions against a loopback sshd directly and never pass
    // through this function long enough to care.
    session.set_keepalive(true, 30);

    Ok(session)
}

fn authenticate(session: &mut ssh2::Session, spec: &ConnectionSpec) -> Result<(), GatewayError> {
    match spec.auth_method {
        AuthMethod::Password => {
            let password = spec.password.as_deref().unwrap_or("");
            session
                .userauth_password(&spec.username, password)
                .map_err(|e| GatewayError::transport_src(format!("password auth failed: {e}"), e))
        }
        AuthMethod::Key => {
            let key = spec
                .private_key
                .as_deref()
                .ok_or_else(|| GatewayError::transport("key auth requested without a private key"))?;
            session
                .userauth_pubkey_memory(&spec.username, None, key, spec.passphrase.as_deref())
                .map_err(|e| GatewayError::transport_src(format!("key auth failed: {e}"), e))
        }
    }
}

fn connect_direct(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, GatewayError> {
    let addr = format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|e| GatewayError::transport_src(format!("invalid address '{host}:{port}': {e}"), e))?
        .next()
        .ok_or_else(|| GatewayError::transport(format!("no addresses resolved for '{host}:{port}'")))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| GatewayError::transport_src(format!("tcp connect to {host}:{port} failed: {e}"), e))?;
    stream.set_nodelay(true).ok();
    tune_keepalive(&stream);
    Ok(stream)
}

#[cfg(unix)]
fn tune_keepalive(stream: &TcpStream) {
    use socket2::{SockRef, TcpKeepalive};
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);
    let _ = sock.set_tcp_keepalive(&keepalive);
}

#[cfg(not(unix))]
fn tune_keepalive(_stream: &TcpStream) {}

/// SOCKS5 `CONNECT` handshake (RFC 1928) against an already-connected proxy socket.
/// Supports no-auth and username/password (RFC 1929) negotiation.
fn socks5_connect(
    mut stream: TcpStream,
    dest_host: &str,
    dest_port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<TcpStream, GatewayError> {
    let has_creds = username.is_some();
    let methods: &[u8] = if has_creds { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = vec![0x05u8, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream
        .write_all(&greeting)
        .map_err(|e| GatewayError::transport_src(format!("socks5 greeting failed: {e}"), e))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .map_err(|e| GatewayError::transport_src(format!("socks5 greeting response failed: {e}"), e))?;
    if reply[0] != 0x05 {
        return Err(GatewayError::transport("socks5 proxy sent an invalid version"));
    }

    match reply[1] {
        0x00 => {}
        0x02 => {
            let user = username.unwrap_or("");
            let pass = password.unwrap_or("");
            let mut auth = vec![0x01u8, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream
                .write_all(&auth)
                .map_err(|e| GatewayError::transport_src(format!("socks5 auth failed: {e}"), e))?;
            let mut auth_reply = [0u8; 2];
            stream
                .read_exact(&mut auth_reply)
                .map_err(|e| GatewayError::transport_src(format!("socks5 auth response failed: {e}"), e))?;
            if auth_reply[1] != 0x00 {
                return Err(GatewayError::transport("socks5 proxy rejected credentials"));
            }
        }
        0xFF => return Err(GatewayError::transport("socks5 proxy accepted no offered auth method")),
        other => return Err(GatewayError::transport(format!("socks5 proxy selected unsupported method {other}"))),
    }

    let mut request = vec![0x05u8, 0x01, 0x00, 0x03, dest_host.len() as u8];
    request.extend_from_slice(dest_host.as_bytes());
    request.extend_from_slice(&dest_port.to_be_bytes());
    stream
        .write_all(&request)
        .map_err(|e| GatewayError::transport_src(format!("socks5 connect request failed: {e}"), e))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .map_err(|e| GatewayError::transport_src(format!("socks5 connect response failed: {e}"), e))?;
    if head[1] != 0x00 {
        return Err(GatewayError::transport(format!("socks5 CONNECT failed with code {}", head[1])));
    }
    // Drain the bound address so the stream is left exactly at the start of
    // the tunneled protocol, regardless of address type.
    let addr_len = match head[3] {
        0x01 => 4,
        0x03 => {
            let mut len_byte = [0u8; 1];
            stream.read_exact(&mut len_byte).map_err(|e| GatewayError::transport_src(e.to_string(), e))?;
            len_byte[0] as usize
        }
        0x04 => 16,
        other => return Err(GatewayError::transport(format!("socks5 unknown address type {other}"))),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut rest)
        .map_err(|e| GatewayError::transport_src(format!("socks5 bound address read failed: {e}"), e))?;

    Ok(stream)
}

/// HTTP `CONNECT` tunnel handshake against an already-connected proxy socket.
fn http_connect(
    mut stream: TcpStream,
    dest_host: &str,
    dest_port: u16,
    username: Option<&str>,
    password: Option<&str>,
    timeout: Duration,
) -> Result<TcpStream, GatewayError> {
    stream.set_read_timeout(Some(timeout)).ok();

    let mut request = format!("CONNECT {dest_host}:{dest_port} HTTP/1.1\r\nHost: {dest_host}:{dest_port}\r\n");
    if let Some(user) = username {
        let pass = password.unwrap_or("");
        let token = B64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .map_err(|e| GatewayError::transport_src(format!("http connect request failed: {e}"), e))?;

    let mut reader = BufReader::new(&mut stream);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .map_err(|e| GatewayError::transport_src(format!("http connect: reading status line failed: {e}"), e))?;

    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GatewayError::transport(format!("http connect: malformed status line '{status_line}'")))?;

    // Drain headers up to the blank line that ends the CONNECT response.
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| GatewayError::transport_src(format!("http connect: reading headers failed: {e}"), e))?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    if status_code != 200 {
        return Err(GatewayError::transport(format!("http connect proxy returned status {status_code}")));
    }

    drop(reader);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn socks5_connect_happy_path_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut greeting = [0u8; 2];
            sock.read_exact(&mut greeting).unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            sock.read_exact(&mut methods).unwrap();
            sock.write_all(&[0x05, 0x00]).unwrap();

            let mut head = [0u8; 5];
            sock.read_exact(&mut head).unwrap();
            let mut host = vec![0u8; head[4] as usize];
            sock.read_exact(&mut host).unwrap();
            let mut port = [0u8; 2];
            sock.read_exact(&mut port).unwrap();

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).unwrap();
        });

        let client = TcpStream::connect(addr).unwrap();
        let result = socks5_connect(client, "example.com", 443, None, None);
        server.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn http_connect_rejects_non_200() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = sock.read(&mut buf);
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").unwrap();
        });

        let client = TcpStream::connect(addr).unwrap();
        let result = http_connect(client, "example.com", 443, None, None, Duration::from_secs(2));
        server.join().unwrap();
        assert!(matches!(result, Err(GatewayError::Transport { .. })));
    }
}

//! RDP Tunnel Proxy (C8, §4.8, §6.2). A second WebSocket path, entirely
//! independent of the SSH Session Multiplexer: validate the handshake query
//! parameters, open an upstream channel to the deployment's RDP service, then
//! relay bytes in both directions until either side closes. Grounded on the
//! connect-then-select relay shape of the teacher's own upstream WebSocket
//! client (see `WebSocketConnection::connect`), simplified to a pure byte
//! pipe since this proxy never parses a frame.

use crate::config::Config;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};

/// `width > 1920` gets the high-DPI upstream hint; everything else gets the
/// standard 96 dpi default (§4.8).
fn dpi_for(width: u32) -> u32 {
    if width > 1920 {
        120
    } else {
        96
    }
}

struct TunnelParams {
    token: String,
    width: u32,
    height: u32,
}

fn parse_params(query: &HashMap<String, String>) -> Option<TunnelParams> {
    let token = query.get("token").filter(|s| !s.is_empty())?.clone();
    let width: u32 = query.get("width")?.parse().ok().filter(|&w| w > 0)?;
    let height: u32 = query.get("height")?.parse().ok().filter(|&h| h > 0)?;
    Some(TunnelParams { token, width, height })
}

/// Drive one RDP tunnel connection end to end. `query` carries the
/// `token`/`width`/`height` parameters parsed from the upgrade request's URI
/// by the listener.
pub async fn handle_connection(ws: WebSocketStream<TcpStream>, config: Arc<Config>, query: HashMap<String, String>) {
    let Some(params) = parse_params(&query) else {
        close_with(ws, CloseCode::Policy, "token, width and height are required positive values").await;
        return;
    };

    let dpi = dpi_for(params.width);
    let upstream_url = format!(
        "{}/?token={}&width={}&height={}&dpi={}",
        config.rdp_upstream_base(),
        urlencode(&params.token),
        params.width,
        params.height,
        dpi
    );

    let upstream = match connect_async(&upstream_url).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "rdp upstream connect failed");
            close_with(ws, CloseCode::Error, "upstream rdp service unavailable").await;
            return;
        }
    };

    let (mut client_sink, mut client_stream) = ws.split();
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    let client_to_upstream = async {
        while let Some(frame) = client_stream.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    if upstream_sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(text)) => {
                    if upstream_sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = upstream_sink.send(Message::Close(Some(normal_close()))).await;
    };

    let upstream_to_client = async {
        while let Some(frame) = upstream_stream.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    if client_sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(text)) => {
                    if client_sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = client_sink.send(Message::Close(Some(normal_close()))).await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

fn normal_close() -> CloseFrame {
    CloseFrame { code: CloseCode::Normal, reason: "".into() }
}

async fn close_with(ws: WebSocketStream<TcpStream>, code: CloseCode, reason: &str) {
    let (mut sink, _) = ws.split();
    let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() }))).await;
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpi_switches_above_1920() {
        assert_eq!(dpi_for(1920), 96);
        assert_eq!(dpi_for(1921), 120);
    }

    #[test]
    fn parse_params_rejects_missing_token() {
        let mut q = HashMap::new();
        q.insert("width".to_string(), "800".to_string());
        q.insert("height".to_string(), "600".to_string());
        assert!(parse_params(&q).is_none());
    }

    #[test]
    fn parse_params_rejects_zero_dimensions() {
        let mut q = HashMap::new();
        q.insert("token".to_string(), "abc".to_string());
        q.insert("width".to_string(), "0".to_string());
        q.insert("height".to_string(), "600".to_string());
        assert!(parse_params(&q).is_none());
    }

    #[test]
    fn parse_params_accepts_valid_input() {
        let mut q = HashMap::new();
        q.insert("token".to_string(), "abc".to_string());
        q.insert("width".to_string(), "1024".to_string());
        q.insert("height".to_string(), "768".to_string());
        let params = parse_params(&q).expect("valid params");
        assert_eq!(params.width, 1024);
        assert_eq!(params.height, 768);
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
    }
}

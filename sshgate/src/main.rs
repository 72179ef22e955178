//! Process entry point: configuration, logging, and the accept loop for the
//! client message channel (§6.1) and the RDP tunnel channel (§6.2), which
//! share one listening socket and split on request path.

use clap::Parser;
use sshgate::config::Config;
use sshgate::events::EventKind;
use sshgate::ip;
use sshgate::profiles::{PassthroughDecryptor, StaticProfileStore};
use sshgate::rdp;
use sshgate::router::{self, AppState, ClientIdentity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;

#[derive(Parser, Debug)]
#[command(version, about = "multi-tenant SSH session multiplexer gateway")]
struct Args {
    /// Path to an optional TOML config file (§6.3); environment variables
    /// still take precedence over anything set here.
    #[arg(long)]
    config: Option<String>,
}

/// Everything the accept callback captures from the upgrade request, since
/// the closure handed to `accept_hdr_async` can't be async.
#[derive(Default, Clone)]
struct UpgradeInfo {
    path: String,
    query: HashMap<String, String>,
    forwarded_for: Option<String>,
    real_ip: Option<String>,
}

fn parse_query(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let mut parts = pair.splitn(2, '=');
                    let key = parts.next()?.to_string();
                    let value = parts.next().unwrap_or("").to_string();
                    Some((key, value))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let profiles = Arc::new(StaticProfileStore::new());
    let decryptor = Arc::new(PassthroughDecryptor);
    let state = Arc::new(AppState::new(config.clone(), profiles, decryptor));
    let rdp_config = Arc::new(config.clone());

    let listener = match TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            state.events.emit(EventKind::ServerError, None, None, Some(serde_json::json!({"error": e.to_string()})));
            tracing::error!(error = %e, addr = %config.bind_addr, "failed to bind listener");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %config.bind_addr, "sshgate listening");
    state.events.emit(EventKind::ServerStarted, None, None, Some(serde_json::json!({"addr": config.bind_addr.to_string()})));

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let state = state.clone();
        let rdp_config = rdp_config.clone();
        tokio::spawn(async move {
            accept_one(stream, peer_addr.ip(), state, rdp_config).await;
        });
    }
}

async fn accept_one(stream: TcpStream, peer_ip: std::net::IpAddr, state: Arc<AppState>, rdp_config: Arc<Config>) {
    let _ = stream.set_nodelay(true);

    let info = Arc::new(Mutex::new(UpgradeInfo::default()));
    let callback_info = info.clone();
    let callback = move |req: &Request, response: Response| {
        let mut captured = callback_info.lock().unwrap();
        captured.path = req.uri().path().to_string();
        captured.query = parse_query(req.uri());
        captured.forwarded_for = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string);
        captured.real_ip = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()).map(str::to_string);
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(error = %e, "websocket upgrade failed");
            return;
        }
    };

    let info = info.lock().unwrap().clone();
    if info.path.starts_with("/rdp") {
        rdp::handle_connection(ws, rdp_config, info.query).await;
        return;
    }

    let identity = ClientIdentity {
        user_id: None,
        username: None,
        ip: ip::derive_ip(info.forwarded_for.as_deref(), info.real_ip.as_deref(), Some(peer_ip)),
    };
    router::handle_connection(ws, state, identity).await;
}

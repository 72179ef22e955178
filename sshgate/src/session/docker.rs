//! Docker Inspector (C7, §4.7). Polls `docker ps`/`docker stats` on the
//! remote host through the same Remote-Exec Helper (C4) the Status Sampler
//! uses, and executes lifecycle commands (`start`/`stop`/`restart`/`remove`)
//! on request. No teacher file does this (the teacher never talks to a
//! remote Docker daemon); grounded instead on the CLI-JSON-parsing shape of
//! `other_examples/c6165147_jiawesoft-jiascheduler__automate-src-ssh.rs` and
//! on this crate's own C4 (`session::actor::exec`).

use crate::models::{DockerContainer, DockerPort, DockerStats, OutboundEnvelope};
use crate::session::handle::SessionHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const UNAVAILABLE_MARKERS: &[&str] = ["command not found", "permission denied", "Cannot connect to the Docker daemon"];

pub fn spawn(session: Arc<SessionHandle>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            poll_once(&session).await;
        }
    })
}

pub(crate) async fn poll_once(session: &Arc<SessionHandle>) {
    match session.exec("docker version --format '{{.Server.Version}}'".to_string()).await {
        Ok(out) if !is_available(&out.stdout, &out.stderr) => {
            emit_status(session, false, Vec::new());
            return;
        }
        Ok(_) => {}
        Err(e) => {
            send_error(session, e.user_message());
            return;
        }
    }

    let ps_output = match session.exec("docker ps -a --no-trunc --format '{{json .}}'".to_string()).await {
        Ok(out) => out,
        Err(e) => {
            send_error(session, e.user_message());
            return;
        }
    };

    let mut containers: Vec<DockerContainer> = ps_output.stdout.lines().filter_map(parse_ps_line).collect();

    let running_ids: Vec<String> = containers
        .iter()
        .filter(|c| c.state.eq_ignore_ascii_case("running"))
        .map(|c| c.id.clone())
        .collect();

    if !running_ids.is_empty() {
        let cmd = format!("docker stats {} --no-stream --format '{{{{json .}}}}'", running_ids.join(" "));
        if let Ok(stats_output) = session.exec(cmd).await {
            let stats_by_key = parse_stats_lines(&stats_output.stdout);
            for container in &mut containers {
                let short_id: String = container.id.chars().take(12).collect();
                let stats = stats_by_key
                    .get(&container.id)
                    .or_else(|| stats_by_key.get(&short_id))
                    .or_else(|| container.names.first().and_then(|n| stats_by_key.get(n)));
                container.stats = stats.cloned();
            }
        }
    }

    emit_status(session, true, containers);
}

fn is_available(stdout: &str, stderr: &str) -> bool {
    if stdout.trim().is_empty() {
        return false;
    }
    !UNAVAILABLE_MARKERS.iter().any(|marker| stderr.contains(marker))
}

fn emit_status(session: &Arc<SessionHandle>, available: bool, containers: Vec<DockerContainer>) {
    session
        .outbound()
        .send(OutboundEnvelope::new("docker:status:update").with_payload(json!({
            "available": available,
            "containers": containers,
        })))
        .ok();
}

fn send_error(session: &Arc<SessionHandle>, message: String) {
    session
        .outbound()
        .send(OutboundEnvelope::new("docker:status:error").with_payload(json!({"message": message})))
        .ok();
}

/// One line of `docker ps -a --no-trunc --format '{{json .}}'`. Field names
/// mirror the stable CLI keys listed in SPEC_FULL.md §9; anything optional
/// tolerates absence via `#[serde(default)]` rather than failing the parse.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Command", default)]
    command: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

fn parse_ps_line(line: &str) -> Option<DockerContainer> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parsed: PsLine = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, line, "failed to parse `docker ps` line");
            return None;
        }
    };
    Some(DockerContainer {
        id: parsed.id,
        names: parsed.names.split(',').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect(),
        image: parsed.image,
        command: parsed.command,
        state: parsed.state,
        status: parsed.status,
        ports: parse_ports(&parsed.ports),
        stats: None,
    })
}

/// Docker's compact textual ports form, e.g.
/// `0.0.0.0:8080->80/tcp, :::8080->80/tcp, 443/tcp`.
fn parse_ports(raw: &str) -> Vec<DockerPort> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(parse_one_port)
        .collect()
}

fn parse_one_port(entry: &str) -> Option<DockerPort> {
    let (mapping, port_type) = entry.rsplit_once('/')?;
    let port_type = port_type.to_string();

    if let Some((host, container)) = mapping.split_once("->") {
        let private_port: u16 = container.trim().parse().ok()?;
        let (ip, public_port) = match host.rsplit_once(':') {
            Some((ip, port)) => (Some(ip.trim_start_matches('[').trim_end_matches(']').to_string()), port.parse().ok()),
            None => (None, host.parse().ok()),
        };
        Some(DockerPort { ip, private_port, public_port, port_type })
    } else {
        let private_port: u16 = mapping.trim().parse().ok()?;
        Some(DockerPort { ip: None, private_port, public_port: None, port_type })
    }
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "BlockIO", default)]
    block_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Index `docker stats` results both by id (full and 12-char short) and by
/// name (§4.7 "merge into each container as `stats`").
fn parse_stats_lines(stdout: &str) -> HashMap<String, DockerStats> {
    let mut out = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: StatsLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, line, "failed to parse `docker stats` line");
                continue;
            }
        };
        let stats = DockerStats {
            cpu_perc: parsed.cpu_perc,
            mem_usage: parsed.mem_usage,
            mem_perc: parsed.mem_perc,
            net_io: parsed.net_io,
            block_io: parsed.block_io,
            pids: parsed.pids,
        };
        if !parsed.id.is_empty() {
            let short: String = parsed.id.chars().take(12).collect();
            out.insert(short, stats.clone());
            out.insert(parsed.id, stats.clone());
        }
        if !parsed.name.is_empty() {
            out.insert(parsed.name, stats);
        }
    }
    out
}

/// `docker:command{containerId, command}` (§4.7). `containerId` is
/// sanitized to `[A-Za-z0-9_-]+` before reaching a shell command; `remove`
/// maps to `docker rm -f` while the other three pass through verbatim.
pub async fn run_command(session: &SessionHandle, container_id: &str, command: &str) -> Result<(), String> {
    if container_id.is_empty() || !container_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(format!("invalid container id '{container_id}'"));
    }

    let cmd = match command {
        "start" => format!("docker start {container_id}"),
        "stop" => format!("docker stop {container_id}"),
        "restart" => format!("docker restart {container_id}"),
        "remove" => format!("docker rm -f {container_id}"),
        other => return Err(format!("unsupported docker command '{other}'")),
    };

    let output = session.exec(cmd).await.map_err(|e| e.user_message())?;
    if output.exit_status == 0 {
        Ok(())
    } else if !output.stderr.trim().is_empty() {
        Err(output.stderr.trim().to_string())
    } else {
        Err(format!("exit code {}", output.exit_status))
    }
}

/// `docker:get_stats{containerId}` (§6.1): an on-demand single-container
/// sample outside the regular poll cadence.
pub async fn stats_for(session: &SessionHandle, container_id: &str) -> Result<DockerStats, String> {
    if container_id.is_empty() || !container_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(format!("invalid container id '{container_id}'"));
    }
    let cmd = format!("docker stats {container_id} --no-stream --format '{{{{json .}}}}'");
    let output = session.exec(cmd).await.map_err(|e| e.user_message())?;
    let map = parse_stats_lines(&output.stdout);
    map.get(container_id)
        .or_else(|| {
            let short: String = container_id.chars().take(12).collect();
            map.get(&short)
        })
        .cloned()
        .ok_or_else(|| format!("no stats for container '{container_id}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_available_false_on_known_failure_strings() {
        assert!(!is_available("", "bash: docker: command not found\n"));
        assert!(!is_available("", "Got permission denied while trying to connect\n"));
        assert!(!is_available("", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock\n"));
        assert!(!is_available("", ""));
    }

    #[test]
    fn is_available_true_on_version_string() {
        assert!(is_available("24.0.7\n", ""));
    }

    #[test]
    fn parse_ps_line_splits_names_and_ports() {
        let line = r#"{"ID":"abc123","Names":"web,web_alias","Image":"nginx","Command":"\"nginx\"","State":"running","Status":"Up 2 hours","Ports":"0.0.0.0:8080->80/tcp"}"#;
        let c = parse_ps_line(line).unwrap();
        assert_eq!(c.id, "abc123");
        assert_eq!(c.names, vec!["web", "web_alias"]);
        assert_eq!(c.ports.len(), 1);
        assert_eq!(c.ports[0].private_port, 80);
        assert_eq!(c.ports[0].public_port, Some(8080));
        assert_eq!(c.ports[0].ip.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn parse_ports_handles_unmapped_port() {
        let ports = parse_ports("443/tcp");
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].private_port, 443);
        assert!(ports[0].public_port.is_none());
    }

    #[test]
    fn parse_stats_lines_indexes_by_short_and_full_id() {
        let stdout = r#"{"ID":"abcdef0123456789","Name":"web","CPUPerc":"1.5%","MemUsage":"10MiB / 1GiB","MemPerc":"1%","NetIO":"1kB / 2kB","BlockIO":"0B / 0B","PIDs":"3"}"#;
        let map = parse_stats_lines(stdout);
        assert!(map.contains_key("abcdef0123456789"));
        assert!(map.contains_key("abcdef012345"));
        assert!(map.contains_key("web"));
    }

    #[tokio::test]
    async fn run_command_rejects_unsanitary_container_id() {
        let (session, _rx) = crate::session::handle::test_handle();
        let err = run_command(&session, "abc; rm -rf /", "stop").await.unwrap_err();
        assert!(err.contains("invalid container id"));
    }

    #[tokio::test]
    async fn run_command_rejects_unknown_command() {
        let (session, _rx) = crate::session::handle::test_handle();
        let err = run_command(&session, "abc123", "bogus").await.unwrap_err();
        assert!(err.contains("unsupported docker command"));
    }
}

//! Status Sampler (C6, §4.6). Polls a session's remote host for CPU/mem/disk/
//! network metrics on a fixed interval, batched into one remote-exec round
//! trip the same way the teacher's `ssh::system::get_remote_system_status`
//! amortizes its own probe — generalized here with the extra `osName`,
//! `cpuModel` and network-rate fields the teacher's desktop-facing probe
//! does not need.

use crate::models::{NetworkSample, OutboundEnvelope};
use crate::session::handle::SessionHandle;
use crate::session::SessionId;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Each section is introduced by a unique marker line so the single combined
/// stdout can be split back into per-metric chunks without needing a
/// delimiter that could plausibly appear in command output itself.
const MARKER_OS: &str = "@@SSHGATE_OS@@";
const MARKER_CPU_MODEL: &str = "@@SSHGATE_CPU_MODEL@@";
const MARKER_MEM: &str = "@@SSHGATE_MEM@@";
const MARKER_DISK: &str = "@@SSHGATE_DISK@@";
const MARKER_CPU_PCT: &str = "@@SSHGATE_CPU_PCT@@";
const MARKER_LOAD: &str = "@@SSHGATE_LOAD@@";
const MARKER_IFACE: &str = "@@SSHGATE_IFACE@@";
const MARKER_NETDEV: &str = "@@SSHGATE_NETDEV@@";

fn probe_script() -> String {
    format!(
        r#"echo '{MARKER_OS}'; cat /etc/os-release 2>/dev/null
echo '{MARKER_CPU_MODEL}'; lscpu 2>/dev/null | grep 'Model name:'
echo '{MARKER_MEM}'; free -m 2>/dev/null
echo '{MARKER_DISK}'; df -k / 2>/dev/null | tail -n1
echo '{MARKER_CPU_PCT}'; top -bn1 2>/dev/null | grep '%Cpu(s)'
echo '{MARKER_LOAD}'; uptime 2>/dev/null
echo '{MARKER_IFACE}'; ip route get 1.1.1.1 2>/dev/null
echo '{MARKER_NETDEV}'; cat /proc/net/dev 2>/dev/null
"#
    )
}

/// Spawn the per-session polling task. Stops the instant the returned handle
/// is aborted, which `SessionHandle::shutdown` does as part of teardown
/// (§4.6 "Stops the instant session teardown begins").
pub fn spawn(
    session: Arc<SessionHandle>,
    connection_id: i64,
    interval: Duration,
    net_cache: Arc<DashMap<SessionId, NetworkSample>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let script = probe_script();
            match session.exec(script).await {
                Ok(output) => {
                    let status = parse_status(&output.stdout, session.id, &net_cache);
                    session
                        .outbound()
                        .send(
                            OutboundEnvelope::new("status_update")
                                .with_payload(json!({"connectionId": connection_id, "status": status})),
                        )
                        .ok();
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "status sampler probe failed");
                    session
                        .outbound()
                        .send(
                            OutboundEnvelope::new("status_error")
                                .with_payload(json!({"message": e.user_message()})),
                        )
                        .ok();
                }
            }
        }
    })
}

/// Split the batched probe output back into its named sections, keyed by
/// marker. A section is every line between its marker and the next one.
fn sections(stdout: &str) -> std::collections::HashMap<&'static str, String> {
    const MARKERS: &[&str] = &[
        MARKER_OS, MARKER_CPU_MODEL, MARKER_MEM, MARKER_DISK, MARKER_CPU_PCT, MARKER_LOAD, MARKER_IFACE,
        MARKER_NETDEV,
    ];
    let mut out: std::collections::HashMap<&'static str, String> = std::collections::HashMap::new();
    let mut current: Option<&'static str> = None;
    for line in stdout.lines() {
        if let Some(marker) = MARKERS.iter().find(|m| line.trim() == **m) {
            current = Some(marker);
            out.entry(marker).or_default();
            continue;
        }
        if let Some(marker) = current {
            let entry = out.entry(marker).or_default();
            entry.push_str(line);
            entry.push('\n');
        }
    }
    out
}

/// Parse the probe output into the `status_update` payload shape. Every
/// field is best-effort (§4.6 "any single metric's failure is swallowed and
/// that field is omitted"): a metric that fails to parse is simply absent
/// from the returned object instead of failing the whole tick.
fn parse_status(stdout: &str, session_id: SessionId, net_cache: &DashMap<SessionId, NetworkSample>) -> Value {
    let secs = sections(stdout);
    let mut status = serde_json::Map::new();

    if let Some(os) = secs.get(MARKER_OS).and_then(|s| parse_os_name(s)) {
        status.insert("osName".into(), Value::String(os));
    }
    if let Some(model) = secs.get(MARKER_CPU_MODEL).and_then(|s| parse_cpu_model(s)) {
        status.insert("cpuModel".into(), Value::String(model));
    }
    if let Some(mem) = secs.get(MARKER_MEM).and_then(|s| parse_mem(s)) {
        status.insert("memory".into(), mem);
    }
    if let Some(disk) = secs.get(MARKER_DISK).and_then(|s| parse_disk(s)) {
        status.insert("disk".into(), disk);
    }
    if let Some(cpu_pct) = secs.get(MARKER_CPU_PCT).and_then(|s| parse_cpu_pct(s)) {
        status.insert("cpuPercent".into(), Value::from(cpu_pct));
    }
    if let Some(load) = secs.get(MARKER_LOAD).and_then(|s| parse_load_average(s)) {
        status.insert("loadAverage".into(), load);
    }

    let netdev = secs.get(MARKER_NETDEV).map(|s| s.as_str()).unwrap_or("");
    let iface = secs
        .get(MARKER_IFACE)
        .and_then(|s| parse_default_iface(s))
        .or_else(|| parse_first_non_lo_iface(netdev));
    if let Some(iface) = iface {
        let rate = parse_iface_counters(netdev, &iface).and_then(|(rx, tx)| network_rate(session_id, rx, tx, net_cache));
        status.insert("networkInterface".into(), Value::String(iface));
        if let Some(rate) = rate {
            status.insert("networkRate".into(), rate);
        }
    }

    Value::Object(status)
}

fn parse_os_name(block: &str) -> Option<String> {
    let mut pretty = None;
    let mut name = None;
    for line in block.lines() {
        if let Some(v) = line.strip_prefix("PRETTY_NAME=") {
            pretty = Some(v.trim_matches('"').to_string());
        } else if let Some(v) = line.strip_prefix("NAME=") {
            name = Some(v.trim_matches('"').to_string());
        }
    }
    pretty.or(name)
}

fn parse_cpu_model(block: &str) -> Option<String> {
    let line = block.lines().find(|l| l.contains("Model name:"))?;
    Some(line.splitn(2, ':').nth(1)?.trim().to_string())
}

fn parse_mem(block: &str) -> Option<Value> {
    let mut mem_row: Option<(f64, f64)> = None;
    let mut swap_row: Option<(f64, f64)> = None;
    for line in block.lines() {
        let mut cols = line.split_whitespace();
        let Some(label) = cols.next() else { continue };
        let rest: Vec<&str> = cols.collect();
        if label == "Mem:" && rest.len() >= 2 {
            let total: f64 = rest[0].parse().ok()?;
            let used: f64 = rest[1].parse().ok()?;
            mem_row = Some((total, used));
        } else if label == "Swap:" && rest.len() >= 2 {
            let total: f64 = rest[0].parse().unwrap_or(0.0);
            let used: f64 = rest[1].parse().unwrap_or(0.0);
            swap_row = Some((total, used));
        }
    }
    let (mem_total, mem_used) = mem_row?;
    let mem_percent = if mem_total > 0.0 { round1(used_percent(mem_used, mem_total)) } else { 0.0 };
    let (swap_total, swap_used) = swap_row.unwrap_or((0.0, 0.0));
    let swap_percent = if swap_total > 0.0 { round1(used_percent(swap_used, swap_total)) } else { 0.0 };

    Some(json!({
        "totalMb": mem_total,
        "usedMb": mem_used,
        "percent": mem_percent,
        "swapTotalMb": swap_total,
        "swapUsedMb": swap_used,
        "swapPercent": swap_percent,
    }))
}

fn parse_disk(block: &str) -> Option<Value> {
    let line = block.lines().find(|l| !l.trim().is_empty())?;
    let cols: Vec<&str> = line.split_whitespace().collect();
    // `df -k / | tail -n1`: Filesystem 1K-blocks Used Available Use% Mounted-on
    if cols.len() < 6 {
        return None;
    }
    let total_kb: u64 = cols[1].parse().ok()?;
    let used_kb: u64 = cols[2].parse().ok()?;
    let percent: f64 = cols[4].trim_end_matches('%').parse().unwrap_or_else(|_| used_percent(used_kb as f64, total_kb as f64));
    Some(json!({"totalKb": total_kb, "usedKb": used_kb, "percent": round1(percent)}))
}

fn parse_cpu_pct(block: &str) -> Option<f64> {
    let line = block.lines().find(|l| l.contains("%Cpu(s)"))?;
    let idle_token = line.split(',').find(|part| part.contains("id"))?;
    let idle: f64 = idle_token.split_whitespace().next()?.parse().ok()?;
    Some(round1((100.0 - idle).max(0.0)))
}

fn parse_load_average(block: &str) -> Option<Value> {
    let line = block.lines().next()?;
    let avg = line.split("average:").nth(1)?;
    let parts: Vec<f64> = avg.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    if parts.len() < 3 {
        return None;
    }
    Some(json!([parts[0], parts[1], parts[2]]))
}

fn parse_default_iface(block: &str) -> Option<String> {
    let line = block.lines().next()?;
    let idx = line.find("dev ")?;
    line[idx + 4..].split_whitespace().next().map(|s| s.to_string())
}

fn parse_first_non_lo_iface(netdev: &str) -> Option<String> {
    netdev.lines().skip(2).find_map(|line| {
        let name = line.split(':').next()?.trim();
        if name.is_empty() || name == "lo" {
            None
        } else {
            Some(name.to_string())
        }
    })
}

/// Returns `(rx_bytes, tx_bytes)` for `iface` from `/proc/net/dev`, whose
/// per-line shape is `iface: rx_bytes rx_packets ... tx_bytes tx_packets ...`.
fn parse_iface_counters(netdev: &str, iface: &str) -> Option<(u64, u64)> {
    for line in netdev.lines().skip(2) {
        let mut split = line.splitn(2, ':');
        let name = split.next()?.trim();
        if name != iface {
            continue;
        }
        let rest = split.next()?;
        let cols: Vec<&str> = rest.split_whitespace().collect();
        if cols.len() < 9 {
            return None;
        }
        let rx: u64 = cols[0].parse().ok()?;
        let tx: u64 = cols[8].parse().ok()?;
        return Some((rx, tx));
    }
    None
}

/// Compute the Δbytes/Δsec rate against the session's previous sample
/// (§3 `NetworkRateCache`, §4.6). Negative deltas (counter reset, interface
/// flap) are clamped to 0; a tick inside the 100ms minimum interval reuses
/// the prior rate rather than dividing by a near-zero duration.
fn network_rate(session_id: SessionId, rx: u64, tx: u64, cache: &DashMap<SessionId, NetworkSample>) -> Option<Value> {
    let now = Instant::now();
    let previous = cache.insert(session_id, NetworkSample { rx_bytes: rx, tx_bytes: tx, at: Some(now) });

    let Some(prev) = previous else { return None };
    let Some(prev_at) = prev.at else { return None };
    let elapsed = now.saturating_duration_since(prev_at);
    if elapsed < Duration::from_millis(100) {
        return None;
    }
    let secs = elapsed.as_secs_f64();
    let rx_rate = (rx.saturating_sub(prev.rx_bytes) as f64 / secs).max(0.0);
    let tx_rate = (tx.saturating_sub(prev.tx_bytes) as f64 / secs).max(0.0);
    Some(json!({"rxBytesPerSec": rx_rate.round(), "txBytesPerSec": tx_rate.round()}))
}

fn used_percent(used: f64, total: f64) -> f64 {
    used / total * 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_os_name_prefers_pretty_name() {
        let block = "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\n";
        assert_eq!(parse_os_name(block).unwrap(), "Ubuntu 22.04.3 LTS");
    }

    #[test]
    fn parse_os_name_falls_back_to_name() {
        let block = "NAME=\"Alpine Linux\"\nVERSION=3.19\n";
        assert_eq!(parse_os_name(block).unwrap(), "Alpine Linux");
    }

    #[test]
    fn parse_mem_computes_percent() {
        let block = "              total        used        free\nMem:           1000         250         750\nSwap:             0           0           0\n";
        let v = parse_mem(block).unwrap();
        assert_eq!(v["totalMb"], 1000.0);
        assert_eq!(v["usedMb"], 250.0);
        assert_eq!(v["percent"], 25.0);
        assert_eq!(v["swapPercent"], 0.0);
    }

    #[test]
    fn parse_disk_computes_percent_from_df() {
        let block = "/dev/sda1 10000000 2500000 7000000 25% /\n";
        let v = parse_disk(block).unwrap();
        assert_eq!(v["totalKb"], 10_000_000u64);
        assert_eq!(v["usedKb"], 2_500_000u64);
        assert_eq!(v["percent"], 25.0);
    }

    #[test]
    fn parse_cpu_pct_is_100_minus_idle() {
        let block = "%Cpu(s):  5.3 us,  1.2 sy,  0.0 ni, 93.0 id,  0.5 wa\n";
        assert_eq!(parse_cpu_pct(block).unwrap(), 7.0);
    }

    #[test]
    fn parse_load_average_extracts_three_floats() {
        let block = " 10:00:01 up 3 days,  2:14,  1 user,  load average: 0.10, 0.20, 0.15\n";
        let v = parse_load_average(block).unwrap();
        assert_eq!(v, json!([0.10, 0.20, 0.15]));
    }

    #[test]
    fn parse_default_iface_extracts_dev_token() {
        let block = "1.1.1.1 via 192.168.1.1 dev eth0 src 192.168.1.50\n";
        assert_eq!(parse_default_iface(block).unwrap(), "eth0");
    }

    #[test]
    fn parse_first_non_lo_iface_skips_loopback() {
        let netdev = "Inter-|   Receive\n face |bytes packets\n  lo: 100 1 0 0 0 0 0 0 100 1 0 0 0 0 0 0\neth0: 200 2 0 0 0 0 0 0 300 3 0 0 0 0 0 0\n";
        assert_eq!(parse_first_non_lo_iface(netdev).unwrap(), "eth0");
    }

    #[test]
    fn parse_iface_counters_reads_rx_and_tx() {
        let netdev = "Inter-|   Receive\n face |bytes packets\neth0: 200 2 0 0 0 0 0 0 300 3 0 0 0 0 0 0\n";
        let (rx, tx) = parse_iface_counters(netdev, "eth0").unwrap();
        assert_eq!(rx, 200);
        assert_eq!(tx, 300);
    }

    #[test]
    fn network_rate_first_sample_has_no_rate() {
        let cache = DashMap::new();
        let id = uuid::Uuid::new_v4();
        assert!(network_rate(id, 100, 100, &cache).is_none());
        assert!(cache.get(&id).is_some());
    }

    #[test]
    fn network_rate_clamps_negative_delta_to_zero() {
        let cache = DashMap::new();
        let id = uuid::Uuid::new_v4();
        cache.insert(id, NetworkSample { rx_bytes: 1000, tx_bytes: 1000, at: Some(Instant::now() - Duration::from_millis(500)) });
        let rate = network_rate(id, 500, 2000, &cache).unwrap();
        assert_eq!(rate["rxBytesPerSec"], 0.0);
        assert!(rate["txBytesPerSec"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn sections_splits_on_markers() {
        let stdout = format!("{MARKER_OS}\nPRETTY_NAME=\"Test\"\n{MARKER_CPU_MODEL}\nModel name: Test CPU\n");
        let secs = sections(&stdout);
        assert!(secs[MARKER_OS].contains("Test"));
        assert!(secs[MARKER_CPU_MODEL].contains("Test CPU"));
    }
}

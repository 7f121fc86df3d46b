use crate::address::uri_host;
use crate::hypervisor::{
    CreateResponse, Hypervisor, JobStats, JobType, MigrateOptions, MigrationParams, stat,
};
use crate::vm::VmStatus;
use crate::{FerryError, Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

/// Drives a libvirt domain through the `virsh` CLI.
pub struct VirshHypervisor {
    domain: String,
    connect_uri: Option<String>,
    uri_scheme: String,
    max_incoming: u32,
}

impl VirshHypervisor {
    pub fn new(domain: impl Into<String>, uri_scheme: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            connect_uri: None,
            uri_scheme: uri_scheme.into(),
            max_incoming: 2,
        }
    }

    /// Connect to a libvirtd other than the local default.
    pub fn with_connect_uri(mut self, uri: Option<String>) -> Self {
        self.connect_uri = uri;
        self
    }

    /// Incoming migrations a destination may already be running before it
    /// counts as busy.
    pub fn with_max_incoming(mut self, max_incoming: u32) -> Self {
        self.max_incoming = max_incoming;
        self
    }

    async fn virsh(&self, connect: Option<&str>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = connect {
            cmd.args(["-c", uri]);
        }
        cmd.args(args).kill_on_drop(true);

        log_debug!("Running virsh {}", args.join(" "));
        let output = cmd
            .output()
            .await
            .map_err(|e| FerryError::SystemCommandFailed(format!("virsh: {}", e)))?;

        if !output.status.success() {
            return Err(FerryError::hypervisor(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn local(&self, args: &[&str]) -> Result<String> {
        self.virsh(self.connect_uri.as_deref(), args).await
    }

    /// The domain's state mapped onto the daemon's VM statuses.
    pub async fn domain_status(&self) -> Result<VmStatus> {
        let state = self.local(&["domstate", &self.domain]).await?;
        Ok(match state.trim() {
            "running" => VmStatus::Up,
            "paused" | "pmsuspended" => VmStatus::Paused,
            "in shutdown" => VmStatus::PoweringDown,
            _ => VmStatus::Down,
        })
    }

    /// Maximum memory of the domain in MiB.
    pub async fn memory_mb(&self) -> Result<u64> {
        let info = self.local(&["dominfo", &self.domain]).await?;
        let kib = dominfo_field(&info, "Max memory")
            .and_then(|value| value.split_whitespace().next())
            .and_then(|kib| kib.parse::<u64>().ok())
            .ok_or_else(|| FerryError::MissingField("Max memory".to_string()))?;
        Ok(kib / 1024)
    }

    async fn incoming_migrations(&self, dest_uri: &str) -> Result<u32> {
        let paused = self
            .virsh(Some(dest_uri), &["list", "--name", "--state-paused"])
            .await?;

        let mut count = 0;
        for name in paused.lines().map(str::trim).filter(|name| !name.is_empty()) {
            match self.virsh(Some(dest_uri), &["domstate", "--reason", name]).await {
                Ok(state) if state.contains("migration") => count += 1,
                Ok(_) => {}
                // The guest may have gone away between the two calls.
                Err(e) => log_debug!("Skipping domain {} on destination: {}", name, e),
            }
        }
        Ok(count)
    }
}

fn dominfo_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == field).then(|| value.trim())
    })
}

/// Translate QMP `query-migrate` output into libvirt-style job stats.
pub fn job_stats_from_query_migrate(reply: &Value) -> JobStats {
    let info = reply.get("return").unwrap_or(reply);
    let status = info.get("status").and_then(Value::as_str).unwrap_or("none");

    let job_type = match status {
        "none" => JobType::None,
        "completed" => JobType::Completed,
        "failed" => JobType::Failed,
        "cancelled" => JobType::Cancelled,
        _ => JobType::Unbounded,
    };

    let mut stats = JobStats::new();
    stats.insert(stat::TYPE.to_string(), job_type.code());

    let field = |section: &str, key: &str| -> Option<u64> {
        info.get(section).and_then(|s| s.get(key)).and_then(Value::as_u64)
    };

    if let Some(elapsed) = info.get("total-time").and_then(Value::as_u64) {
        stats.insert(stat::TIME_ELAPSED.to_string(), elapsed);
    }

    if let (Some(total), Some(remaining), Some(transferred)) = (
        field("ram", "total"),
        field("ram", "remaining"),
        field("ram", "transferred"),
    ) {
        let disk_total = field("disk", "total").unwrap_or(0);
        let disk_remaining = field("disk", "remaining").unwrap_or(0);
        let disk_transferred = field("disk", "transferred").unwrap_or(0);

        stats.insert(stat::MEMORY_TOTAL.to_string(), total);
        stats.insert(stat::MEMORY_REMAINING.to_string(), remaining);
        stats.insert(stat::MEMORY_PROCESSED.to_string(), transferred);
        stats.insert(stat::DATA_TOTAL.to_string(), total + disk_total);
        stats.insert(stat::DATA_REMAINING.to_string(), remaining + disk_remaining);
        stats.insert(stat::DATA_PROCESSED.to_string(), transferred + disk_transferred);
    }

    // QMP reports Mbit/s as a float
    if let Some(mbps) = info.get("ram").and_then(|r| r.get("mbps")).and_then(Value::as_f64) {
        stats.insert(stat::MEMORY_BPS.to_string(), (mbps * 1_000_000.0 / 8.0) as u64);
    }
    for (qmp, key) in [
        ("duplicate", stat::MEMORY_CONSTANT),
        ("dirty-pages-rate", stat::MEMORY_DIRTY_RATE),
        ("dirty-sync-count", stat::MEMORY_ITERATION),
    ] {
        if let Some(value) = field("ram", qmp) {
            stats.insert(key.to_string(), value);
        }
    }
    if let Some(compressed) = field("compression", "compressed-size") {
        stats.insert(stat::COMPRESSION_BYTES.to_string(), compressed);
    }

    let postcopy_requests = field("ram", "postcopy-requests").unwrap_or(0);
    if status == "postcopy-active" || postcopy_requests > 0 {
        stats.insert(
            stat::MEMORY_POSTCOPY_REQUESTS.to_string(),
            postcopy_requests.max(1),
        );
    }

    stats
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn start_migration(
        &self,
        params: &MigrationParams,
        downtime_limit: u64,
    ) -> Result<CreateResponse> {
        let dst = params
            .dst
            .as_deref()
            .ok_or_else(|| FerryError::InvalidArgument("no destination host".to_string()))?;
        let dest_uri = format!("{}://{}/system", self.uri_scheme, uri_host(dst)?);

        if let Err(e) = self.virsh(Some(&dest_uri), &["version"]).await {
            log_warn!("Cannot reach libvirt on destination {}: {}", dest_uri, e);
            return Ok(CreateResponse::error(
                1,
                format!("libvirt unavailable on {}", dest_uri),
            ));
        }

        let incoming = self.incoming_migrations(&dest_uri).await?;
        if incoming >= self.max_incoming {
            log_info!(
                "Destination {} already has {} incoming migration(s)",
                dest_uri,
                incoming
            );
            return Ok(CreateResponse::limit_exceeded());
        }

        log_debug!(
            "Destination {} ready for '{}' (downtime limit {}ms)",
            dest_uri,
            params.vm_name,
            downtime_limit
        );
        Ok(CreateResponse::success())
    }

    async fn set_max_downtime(&self, downtime_ms: u64) -> Result<()> {
        self.local(&["migrate-setmaxdowntime", &self.domain, &downtime_ms.to_string()])
            .await
            .map(|_| ())
    }

    async fn get_job_stats(&self) -> Result<JobStats> {
        let reply = self
            .local(&[
                "qemu-monitor-command",
                &self.domain,
                r#"{"execute":"query-migrate"}"#,
            ])
            .await?;
        let value: Value = serde_json::from_str(&reply)?;
        Ok(job_stats_from_query_migrate(&value))
    }

    async fn migrate_to_destination(&self, uri: &str, options: &MigrateOptions) -> Result<()> {
        let mut args: Vec<String> = vec!["migrate".to_string()];
        let flags = [
            (options.live, "--live"),
            (options.peer_to_peer, "--p2p"),
            (options.persist_dest, "--persistent"),
            (options.undefine_source, "--undefinesource"),
            (options.abort_on_error, "--abort-on-error"),
            (options.post_copy, "--postcopy"),
        ];
        args.extend(
            flags
                .iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, flag)| flag.to_string()),
        );
        if let Some(bandwidth) = options.bandwidth {
            args.push("--bandwidth".to_string());
            args.push(bandwidth.to_string());
        }
        if let Some(migrate_uri) = &options.migrate_uri {
            args.push("--migrateuri".to_string());
            args.push(migrate_uri.clone());
        }
        args.push(self.domain.clone());
        args.push(uri.to_string());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.local(&args).await.map(|_| ())
    }

    async fn is_persistent(&self) -> Result<bool> {
        let info = self.local(&["dominfo", &self.domain]).await?;
        Ok(dominfo_field(&info, "Persistent") == Some("yes"))
    }

    async fn abort_job(&self) -> Result<()> {
        self.local(&["domjobabort", &self.domain]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{MigrationPhase, Progress, ongoing};
    use serde_json::json;

    #[test]
    fn test_active_migration_stats() {
        let reply = json!({
            "return": {
                "status": "active",
                "total-time": 1200,
                "ram": {
                    "total": 1000,
                    "remaining": 250,
                    "transferred": 800,
                    "duplicate": 7,
                    "mbps": 8.0,
                    "dirty-pages-rate": 12,
                    "dirty-sync-count": 3
                }
            }
        });
        let stats = job_stats_from_query_migrate(&reply);
        assert!(ongoing(&stats));

        let progress = Progress::from_job_stats(&stats).unwrap();
        assert_eq!(progress.percentage(), 75);
        assert_eq!(progress.mem_bps, Some(1_000_000));
        assert_eq!(progress.mem_iteration, Some(3));
        assert_eq!(progress.phase(), MigrationPhase::PreCopy);
    }

    #[test]
    fn test_postcopy_status_sets_phase() {
        let reply = json!({
            "return": {
                "status": "postcopy-active",
                "total-time": 10,
                "ram": { "total": 10, "remaining": 5, "transferred": 5 }
            }
        });
        let stats = job_stats_from_query_migrate(&reply);
        let progress = Progress::from_job_stats(&stats).unwrap();
        assert_eq!(progress.phase(), MigrationPhase::PostCopy);
    }

    #[test]
    fn test_idle_domain() {
        let stats = job_stats_from_query_migrate(&json!({ "return": {} }));
        assert!(!ongoing(&stats));
        assert!(matches!(
            Progress::from_job_stats(&stats),
            Err(FerryError::MissingField(_))
        ));
    }

    #[test]
    fn test_dominfo_field() {
        let info = "Id:             3\nName:           guest\nMax memory:     4194304 KiB\nPersistent:     yes\n";
        assert_eq!(dominfo_field(info, "Persistent"), Some("yes"));
        assert_eq!(dominfo_field(info, "Max memory"), Some("4194304 KiB"));
        assert_eq!(dominfo_field(info, "Autostart"), None);
    }
}

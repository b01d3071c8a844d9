use core::{fmt::Display, time::Duration};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The database kinds the agent can back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Postgres,
    Mysql,
    Mongodb,
    Redis,
}

impl DbKind {
    /// Parse a `backup.type` label value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "postgres" => Some(Self::Postgres),
            "mysql" => Some(Self::Mysql),
            "mongodb" => Some(Self::Mongodb),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }

    /// The label/payload spelling of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mongodb => "mongodb",
            Self::Redis => "redis",
        }
    }
}

impl Display for DbKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a backup is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    #[default]
    Local,
    Remote,
}

impl Destination {
    /// Parse a `backup.dest` label value. Empty defaults to local.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "" | "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// The backup configuration for a container, parsed from its labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSpec {
    /// Whether the backup is enabled.
    pub enabled: bool,
    /// The database kind.
    pub kind: DbKind,
    /// The connection URI for the dumper.
    pub conn: String,
    /// The specific database to back up.
    pub database: Option<String>,
    /// The cron schedule, as written on the label.
    pub cron: String,
    /// The destination to write to.
    pub dest: Destination,
    /// Object key prefix, normalized without surrounding slashes.
    pub prefix: String,
    /// Per-spec webhook URL override.
    pub webhook: Option<String>,
    /// Retention override. Zero means "use the global default".
    pub retention: Duration,
    /// The container this spec was parsed from.
    pub container_id: String,
    /// The container's name, without the leading slash.
    pub container_name: String,
}

/// Extract a backup spec from container labels.
///
/// Returns `None` unless `backup.enabled` is exactly `"true"`, `backup.cron`
/// is non-empty, `backup.type` is a known kind, and (for non-redis kinds)
/// `backup.conn` is non-empty.
pub fn parse_labels(
    labels: &HashMap<String, String>,
    container_id: &str,
    container_name: &str,
) -> Option<BackupSpec> {
    let get_label = |key: &str| labels.get(key).map(|value| value.trim()).unwrap_or("");

    let enabled = get_label("backup.enabled");
    if enabled != "true" {
        if !enabled.is_empty() {
            debug!("Backup not enabled for container {container_id}: backup.enabled={enabled}");
        }
        return None;
    }

    let cron = get_label("backup.cron");
    if cron.is_empty() {
        warn!("backup.cron label is missing or empty, cannot schedule backup for container {container_id}");
        return None;
    }

    let kind_value = get_label("backup.type");
    let Some(kind) = DbKind::parse(kind_value) else {
        warn!("backup.type label '{kind_value}' is missing or unknown for container {container_id}");
        return None;
    };

    let conn = get_label("backup.conn");
    if conn.is_empty() && kind != DbKind::Redis {
        warn!("backup.conn label is missing or empty for enabled {kind} container {container_id}");
        return None;
    }

    let Some(dest) = Destination::parse(get_label("backup.dest")) else {
        warn!(
            "backup.dest label '{}' is not 'local' or 'remote' for container {container_id}",
            get_label("backup.dest")
        );
        return None;
    };

    let database = match get_label("backup.database") {
        "" => None,
        database => Some(database.to_owned()),
    };

    let webhook = match get_label("backup.webhook") {
        "" => None,
        webhook => Some(webhook.to_owned()),
    };

    Some(BackupSpec {
        enabled: true,
        kind,
        conn: conn.to_owned(),
        database,
        cron: cron.to_owned(),
        dest,
        prefix: get_label("backup.prefix").trim_matches('/').to_owned(),
        webhook,
        retention: parse_retention(get_label("backup.retention")),
        container_id: container_id.to_owned(),
        container_name: container_name.trim_start_matches('/').to_owned(),
    })
}

/// Parse a retention value like `"7d"`, `"24h"`, `"1h30m"`, or a plain number
/// of days.
///
/// Returns zero for empty, negative, or unparseable values, which means "use
/// the global default".
pub fn parse_retention(value: &str) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return Duration::ZERO;
    }

    if let Ok(duration) = humantime::parse_duration(value) {
        return duration;
    }

    // A plain number, or a number with a `d` suffix, is a count of days.
    let days_str = value.strip_suffix('d').unwrap_or(value);
    match days_str.parse::<i64>() {
        Ok(days) if days >= 0 => Duration::from_secs(days as u64 * 24 * 60 * 60),
        Ok(_) => {
            warn!("Negative retention '{value}' specified, using global default");
            Duration::ZERO
        }
        Err(_) => {
            warn!(
                "Invalid retention '{value}', using global default. \
                 Supported formats: '10h', '30m', '7d', or a number of days."
            );
            Duration::ZERO
        }
    }
}

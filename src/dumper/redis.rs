use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::{pipeline::DumpSink, spec::BackupSpec};

use super::{run_probe, stream_command, DumpError, Dumper};

/// Dumps a Redis instance with `redis-cli --rdb -`.
pub struct RedisDumper;

struct RedisConnParams {
    host: String,
    port: u16,
    password: Option<String>,
    db_num: Option<String>,
}

/// Parse a `redis://` URI or the bare `host:port` / `pass@host:port` forms.
/// An empty connection string targets localhost.
fn parse_redis_conn(conn: &str) -> Result<RedisConnParams, DumpError> {
    if conn.is_empty() {
        return Ok(RedisConnParams {
            host: "localhost".to_owned(),
            port: 6379,
            password: None,
            db_num: None,
        });
    }

    if conn.starts_with("redis://") {
        let url = Url::parse(conn).map_err(|error| DumpError::InvalidUri(error.to_string()))?;

        let host = url.host_str().unwrap_or_default().to_owned();
        if host.is_empty() {
            return Err(DumpError::InvalidUri(format!("host missing in '{conn}'")));
        }

        let db_num = match url.path().trim_start_matches('/') {
            "" => None,
            db_num => Some(db_num.to_owned()),
        };

        return Ok(RedisConnParams {
            host,
            port: url.port().unwrap_or(6379),
            password: url.password().map(str::to_owned),
            db_num,
        });
    }

    let (password, host_port) = match conn.split_once('@') {
        Some((credentials, rest)) => {
            let password = credentials.strip_prefix(':').unwrap_or(credentials);
            (Some(password.to_owned()), rest)
        }
        None => (None, conn),
    };

    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| DumpError::InvalidUri(format!("invalid port in '{conn}'")))?;
            (host, port)
        }
        None => (host_port, 6379),
    };

    if host.is_empty() {
        return Err(DumpError::InvalidUri(format!(
            "failed to parse a host from '{conn}'"
        )));
    }

    Ok(RedisConnParams {
        host: host.to_owned(),
        port,
        password,
        db_num: None,
    })
}

fn base_args(spec: &BackupSpec, params: &RedisConnParams) -> Vec<String> {
    let mut args = vec![
        "-h".to_owned(),
        params.host.clone(),
        "-p".to_owned(),
        params.port.to_string(),
    ];

    let db_num = spec.database.clone().or_else(|| params.db_num.clone());
    if let Some(db_num) = db_num {
        args.push("-n".to_owned());
        args.push(db_num);
    }

    args
}

#[async_trait]
impl Dumper for RedisDumper {
    async fn dump(
        &self,
        spec: &BackupSpec,
        sink: &mut DumpSink,
        cancel: &CancellationToken,
    ) -> Result<(), DumpError> {
        let params = parse_redis_conn(&spec.conn)?;

        let mut args = base_args(spec, &params);
        args.push("--rdb".to_owned());
        args.push("-".to_owned());

        let mut command = Command::new("redis-cli");
        command.args(&args);

        // REDISCLI_AUTH keeps the password out of the process list.
        if let Some(password) = &params.password {
            command.env("REDISCLI_AUTH", password);
        }

        info!(
            "Executing redis-cli {} (password {})",
            args.join(" "),
            if params.password.is_some() { "via env" } else { "unset" },
        );

        stream_command(command, "redis-cli", sink, cancel).await
    }

    async fn test_connection(&self, spec: &BackupSpec) -> Result<(), DumpError> {
        let params = parse_redis_conn(&spec.conn)?;

        let mut args = base_args(spec, &params);
        args.push("ping".to_owned());

        let mut command = Command::new("redis-cli");
        command.args(&args);

        if let Some(password) = &params.password {
            command.env("REDISCLI_AUTH", password);
        }

        debug!(
            "Testing Redis connection to {}:{}",
            params.host, params.port
        );

        run_probe(command, "redis-cli").await
    }
}

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::{pipeline::DumpSink, spec::BackupSpec};

use super::{run_probe, stream_command, DumpError, Dumper};

/// Dumps a PostgreSQL database with `pg_dump`.
pub struct PostgresDumper;

struct PostgresConnParams {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    db_name: String,
}

fn parse_postgres_uri(conn: &str) -> Result<PostgresConnParams, DumpError> {
    if !conn.starts_with("postgresql://") && !conn.starts_with("postgres://") {
        return Err(DumpError::InvalidUri(format!(
            "must start with postgresql:// or postgres://, got '{conn}'"
        )));
    }

    let url = Url::parse(conn).map_err(|error| DumpError::InvalidUri(error.to_string()))?;

    let host = url.host_str().unwrap_or_default().to_owned();
    if host.is_empty() {
        return Err(DumpError::InvalidUri(format!("host missing in '{conn}'")));
    }

    let db_name = url.path().trim_start_matches('/').to_owned();
    if db_name.is_empty() {
        return Err(DumpError::MissingDatabase);
    }

    let user = match url.username() {
        "" => None,
        user => Some(user.to_owned()),
    };

    Ok(PostgresConnParams {
        host,
        port: url.port().unwrap_or(5432),
        user,
        password: url.password().map(str::to_owned),
        db_name,
    })
}

fn base_args(params: &PostgresConnParams) -> Vec<String> {
    let mut args = vec![
        "-h".to_owned(),
        params.host.clone(),
        "-p".to_owned(),
        params.port.to_string(),
    ];

    if let Some(user) = &params.user {
        args.push("-U".to_owned());
        args.push(user.clone());
    }

    args
}

#[async_trait]
impl Dumper for PostgresDumper {
    async fn dump(
        &self,
        spec: &BackupSpec,
        sink: &mut DumpSink,
        cancel: &CancellationToken,
    ) -> Result<(), DumpError> {
        let params = parse_postgres_uri(&spec.conn)?;

        let mut args = base_args(&params);
        args.push("-Fc".to_owned());
        args.push(params.db_name.clone());

        let mut command = Command::new("pg_dump");
        command.args(&args);

        if let Some(password) = &params.password {
            command.env("PGPASSWORD", password);
        }

        info!(
            "Executing pg_dump {} (database {}, password {})",
            args.join(" "),
            params.db_name,
            if params.password.is_some() { "via env" } else { "unset" },
        );

        stream_command(command, "pg_dump", sink, cancel).await
    }

    async fn test_connection(&self, spec: &BackupSpec) -> Result<(), DumpError> {
        let params = parse_postgres_uri(&spec.conn)?;

        let mut args = base_args(&params);
        args.push("-d".to_owned());
        args.push(params.db_name.clone());
        args.push("-c".to_owned());
        args.push("SELECT 1;".to_owned());

        let mut command = Command::new("psql");
        command.args(&args);

        if let Some(password) = &params.password {
            command.env("PGPASSWORD", password);
        }

        debug!(
            "Testing PostgreSQL connection to {}:{}/{}",
            params.host, params.port, params.db_name
        );

        run_probe(command, "psql").await
    }
}

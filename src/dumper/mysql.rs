use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{pipeline::DumpSink, spec::BackupSpec};

use super::{run_probe, stream_command, DumpError, Dumper};

/// Dumps a MySQL/MariaDB database with `mariadb-dump`.
pub struct MysqlDumper;

struct MysqlConnParams {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    db_name: Option<String>,
    ssl_mode: Option<String>,
}

fn parse_mysql_uri(conn: &str) -> Result<MysqlConnParams, DumpError> {
    if !conn.starts_with("mysql://") {
        return Err(DumpError::InvalidUri(format!(
            "must start with mysql://, got '{conn}'"
        )));
    }

    let url = Url::parse(conn).map_err(|error| DumpError::InvalidUri(error.to_string()))?;

    let host = url.host_str().unwrap_or_default().to_owned();
    if host.is_empty() {
        return Err(DumpError::InvalidUri(format!("host missing in '{conn}'")));
    }

    let db_name = match url.path().trim_start_matches('/') {
        "" => None,
        db_name => Some(db_name.to_owned()),
    };

    let user = match url.username() {
        "" => None,
        user => Some(user.to_owned()),
    };

    let ssl_mode = url
        .query_pairs()
        .find(|(key, _)| key == "sslmode")
        .map(|(_, value)| value.into_owned());

    Ok(MysqlConnParams {
        host,
        port: url.port().unwrap_or(3306),
        user,
        password: url.password().map(str::to_owned),
        db_name,
        ssl_mode,
    })
}

/// The database to operate on: the label wins over the URI path.
fn database_for(spec: &BackupSpec, params: &MysqlConnParams) -> Result<String, DumpError> {
    spec.database
        .clone()
        .or_else(|| params.db_name.clone())
        .ok_or(DumpError::MissingDatabase)
}

#[async_trait]
impl Dumper for MysqlDumper {
    async fn dump(
        &self,
        spec: &BackupSpec,
        sink: &mut DumpSink,
        cancel: &CancellationToken,
    ) -> Result<(), DumpError> {
        let params = parse_mysql_uri(&spec.conn)?;
        let database = database_for(spec, &params)?;

        let mut args = vec![
            format!("--host={}", params.host),
            format!("--port={}", params.port),
        ];

        if let Some(user) = &params.user {
            args.push(format!("--user={user}"));
        }

        match params.ssl_mode.as_deref().map(str::to_lowercase).as_deref() {
            Some("disable" | "disabled") => args.push("--ssl=0".to_owned()),
            Some(ssl_mode) => warn!(
                "MySQL sslmode '{ssl_mode}' is not 'disabled'; the server and client must \
                 negotiate SSL themselves"
            ),
            None => {}
        }

        args.push("--single-transaction".to_owned());
        args.push("--routines".to_owned());
        args.push("--triggers".to_owned());
        args.push("--skip-lock-tables".to_owned());
        args.push(database.clone());

        let mut command = Command::new("mariadb-dump");
        command.args(&args);

        // MYSQL_PWD keeps the password out of the process list.
        if let Some(password) = &params.password {
            command.env("MYSQL_PWD", password);
        }

        info!(
            "Executing mariadb-dump {} (database {database}, password {})",
            args.join(" "),
            if params.password.is_some() { "via env" } else { "unset" },
        );

        stream_command(command, "mariadb-dump", sink, cancel).await
    }

    async fn test_connection(&self, spec: &BackupSpec) -> Result<(), DumpError> {
        let params = parse_mysql_uri(&spec.conn)?;

        let mut args = vec![
            "-h".to_owned(),
            params.host.clone(),
            "-P".to_owned(),
            params.port.to_string(),
        ];

        if let Some(user) = &params.user {
            args.push("-u".to_owned());
            args.push(user.clone());
        }

        if let Ok(database) = database_for(spec, &params) {
            args.push(database);
        }

        args.push("-e".to_owned());
        args.push("SELECT 1;".to_owned());

        let mut command = Command::new("mysql");
        command.args(&args);

        if let Some(password) = &params.password {
            command.env("MYSQL_PWD", password);
        }

        debug!(
            "Testing MySQL connection to {}:{}",
            params.host, params.port
        );

        run_probe(command, "mysql").await
    }
}

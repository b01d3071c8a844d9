use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{pipeline::DumpSink, spec::BackupSpec};

use super::{run_probe, stream_command, DumpError, Dumper};

/// Dumps a MongoDB database with `mongodump --archive`.
pub struct MongodbDumper;

/// Hide the credentials in a MongoDB URI for logging.
fn mask_uri(uri: &str) -> String {
    if !uri.starts_with("mongodb://") && !uri.starts_with("mongodb+srv://") {
        return uri.to_owned();
    }

    match (uri.find("://"), uri.find('@')) {
        (Some(scheme_end), Some(cred_end)) if cred_end > scheme_end + 3 => {
            format!("{}<credentials>{}", &uri[..scheme_end + 3], &uri[cred_end..])
        }
        _ => uri.to_owned(),
    }
}

/// The database named in the spec, or parsed from the end of the URI path.
fn database_for(spec: &BackupSpec) -> Option<String> {
    if let Some(database) = &spec.database {
        return Some(database.clone());
    }

    let tail = spec.conn.rsplit('/').next()?;
    if tail == spec.conn {
        return None;
    }

    let database = tail.split('?').next().unwrap_or("");
    if database.is_empty() {
        None
    } else {
        Some(database.to_owned())
    }
}

#[async_trait]
impl Dumper for MongodbDumper {
    async fn dump(
        &self,
        spec: &BackupSpec,
        sink: &mut DumpSink,
        cancel: &CancellationToken,
    ) -> Result<(), DumpError> {
        if spec.conn.is_empty() {
            return Err(DumpError::InvalidUri(
                "mongodb connection string is empty".to_owned(),
            ));
        }

        let mut args = vec![format!("--uri={}", spec.conn)];
        let mut logged_args = vec![format!("--uri={}", mask_uri(&spec.conn))];

        let database = database_for(spec);
        if let Some(database) = &spec.database {
            // Only pass --db when the URI path does not already name it.
            let in_uri = spec.conn.contains(&format!("/{database}?"))
                || spec.conn.ends_with(&format!("/{database}"));
            if !in_uri {
                args.push(format!("--db={database}"));
                logged_args.push(format!("--db={database}"));
            }
        }

        if database.is_none() {
            warn!(
                "MongoDB database not specified and not parsable from the URI; \
                 mongodump may back up all databases"
            );
        }

        args.push("--archive".to_owned());
        logged_args.push("--archive".to_owned());

        let mut command = Command::new("mongodump");
        command.args(&args);

        info!("Executing mongodump {}", logged_args.join(" "));

        stream_command(command, "mongodump", sink, cancel).await
    }

    async fn test_connection(&self, spec: &BackupSpec) -> Result<(), DumpError> {
        if spec.conn.is_empty() {
            return Err(DumpError::InvalidUri(
                "mongodb connection string is empty".to_owned(),
            ));
        }

        // A ping through mongosh leaves nothing behind on disk.
        let mut command = Command::new("mongosh");
        command
            .arg(&spec.conn)
            .args(["--quiet", "--eval", "db.adminCommand('ping')"]);

        debug!("Testing MongoDB connection to {}", mask_uri(&spec.conn));

        run_probe(command, "mongosh").await
    }
}

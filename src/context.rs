use core::fmt::Display;

use crate::spec::BackupSpec;

/// Holds the context for the current backup job. Used for prefixing logs.
#[derive(Default, Debug)]
pub struct Context {
    /// The container this job is for.
    pub container: Option<(String, String)>,
    /// The current stage.
    pub stage: &'static str,
}

impl Context {
    /// Create a context for a spec.
    pub fn for_spec(spec: &BackupSpec) -> Self {
        Self {
            container: Some((spec.container_name.clone(), short_id(&spec.container_id))),
            stage: "",
        }
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some((name, id)) = &self.container {
            write!(f, "[{name}/{id}] ")?;
        }

        if !self.stage.is_empty() {
            write!(f, "[{}] ", self.stage)?;
        }

        Ok(())
    }
}

/// Shorten a container id to the 12-character form the runtime prints.
pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

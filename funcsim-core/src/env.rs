//! Per-invocation environment staging
//!
//! An [`EnvSnapshot`] is an immutable description of what an invocation
//! needs in the process environment: *defaults* that apply only when the
//! variable is unset, and *overrides* that always apply. Applying a
//! snapshot records a diff so the override keys marked for teardown can be
//! restored when the invocation finalizes.
//!
//! Staging must complete before the handler library is loaded; handler
//! code may read these variables at load time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

pub const FUNCTION_NAME_VAR: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const MEMORY_SIZE_VAR: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
pub const FUNCTION_VERSION_VAR: &str = "AWS_LAMBDA_FUNCTION_VERSION";
pub const EXECUTION_ENV_VAR: &str = "AWS_EXECUTION_ENV";
pub const TASK_ROOT_VAR: &str = "LAMBDA_TASK_ROOT";
pub const LOG_GROUP_VAR: &str = "AWS_LAMBDA_LOG_GROUP_NAME";
pub const LOG_STREAM_VAR: &str = "AWS_LAMBDA_LOG_STREAM_NAME";
pub const REGION_VAR: &str = "AWS_REGION";
pub const DEFAULT_REGION_VAR: &str = "AWS_DEFAULT_REGION";
pub const TIMEZONE_VAR: &str = "TZ";

pub const DEFAULT_REGION: &str = "us-east-1";
pub const FUNCTION_VERSION: &str = "$LATEST";

/// Derive the handler identifier from a library path and export name.
///
/// `/a/b/foo.so` + `bar` becomes `foo.bar`; a pathless (in-memory) handler
/// becomes `index.bar`.
pub fn handler_identifier(path: Option<&Path>, export: &str) -> String {
    let stem = path
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .unwrap_or("index");
    format!("{}.{}", stem, export)
}

/// The handler's containing directory, or the current working directory
/// for in-memory handlers.
pub fn task_root(path: Option<&Path>) -> PathBuf {
    path.and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Local zone as a POSIX TZ string. POSIX offsets are west-positive.
fn local_posix_timezone() -> String {
    use chrono::Offset;

    let seconds = -chrono::Local::now().offset().fix().local_minus_utc();
    let sign = if seconds < 0 { '-' } else { '+' };
    let seconds = seconds.abs();
    format!("UTC{}{:02}:{:02}", sign, seconds / 3600, (seconds % 3600) / 60)
}

/// Host free memory in MiB, used as the default memory-size value.
fn host_free_memory_mib() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    (system.free_memory() / (1024 * 1024)).max(1)
}

/// Immutable environment description for one invocation
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    defaults: HashMap<String, String>,
    overrides: HashMap<String, String>,
    teardown: HashSet<String>,
}

impl EnvSnapshot {
    /// Compute the staged variables for an invocation.
    ///
    /// Region handling: a caller-supplied region always overrides; with no
    /// caller region, `us-east-1` is staged as a default so a pre-existing
    /// process value wins.
    pub fn for_invocation(
        identifier: &str,
        task_root: &Path,
        invoke_id: &str,
        memory_mb: Option<u64>,
        region: Option<&str>,
    ) -> Self {
        let mut defaults = HashMap::new();
        let mut overrides = HashMap::new();

        let memory = memory_mb.unwrap_or_else(host_free_memory_mib);
        let stream_suffix: String = invoke_id.chars().take(8).collect();

        defaults.insert(FUNCTION_NAME_VAR.to_string(), identifier.to_string());
        defaults.insert(MEMORY_SIZE_VAR.to_string(), memory.to_string());
        defaults.insert(
            FUNCTION_VERSION_VAR.to_string(),
            FUNCTION_VERSION.to_string(),
        );
        defaults.insert(
            EXECUTION_ENV_VAR.to_string(),
            concat!("AWS_Lambda_rust_funcsim_", env!("CARGO_PKG_VERSION")).to_string(),
        );
        defaults.insert(
            TASK_ROOT_VAR.to_string(),
            task_root.to_string_lossy().into_owned(),
        );
        defaults.insert(
            LOG_GROUP_VAR.to_string(),
            format!("/aws/lambda/{}", identifier),
        );
        defaults.insert(
            LOG_STREAM_VAR.to_string(),
            format!("{}/[{}]{}", Utc::now().format("%Y/%m/%d"), FUNCTION_VERSION, stream_suffix),
        );
        // A host-set TZ name is never overwritten since this stages as
        // a default.
        defaults.insert(TIMEZONE_VAR.to_string(), local_posix_timezone());

        match region {
            Some(r) => {
                overrides.insert(REGION_VAR.to_string(), r.to_string());
                overrides.insert(DEFAULT_REGION_VAR.to_string(), r.to_string());
            }
            None => {
                defaults.insert(REGION_VAR.to_string(), DEFAULT_REGION.to_string());
                defaults.insert(DEFAULT_REGION_VAR.to_string(), DEFAULT_REGION.to_string());
            }
        }

        Self {
            defaults,
            overrides,
            teardown: HashSet::new(),
        }
    }

    /// Merge additional default entries (e.g. credential-derived keys).
    /// Existing defaults keep precedence.
    pub fn with_defaults(mut self, vars: HashMap<String, String>) -> Self {
        for (key, value) in vars {
            self.defaults.entry(key).or_insert(value);
        }
        self
    }

    /// Add caller-supplied custom variables. Custom variables always
    /// override; with `destroy` set their keys are restored at teardown.
    pub fn with_custom(mut self, vars: &HashMap<String, String>, destroy: bool) -> Self {
        for (key, value) in vars {
            if destroy {
                self.teardown.insert(key.clone());
            }
            self.overrides.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn defaults(&self) -> &HashMap<String, String> {
        &self.defaults
    }

    pub fn overrides(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    /// Apply the snapshot to the process environment.
    ///
    /// Defaults only fill unset variables; overrides always set. Prior
    /// values of teardown keys are recorded so [`StagedEnv::revert`] can
    /// restore them.
    pub fn apply(&self) -> StagedEnv {
        for (key, value) in &self.defaults {
            if std::env::var_os(key).is_none() {
                std::env::set_var(key, value);
            }
        }

        let mut recorded = Vec::new();
        for (key, value) in &self.overrides {
            if self.teardown.contains(key) {
                recorded.push((key.clone(), std::env::var(key).ok()));
            }
            std::env::set_var(key, value);
        }

        debug!(
            defaults = self.defaults.len(),
            overrides = self.overrides.len(),
            teardown = self.teardown.len(),
            "Staged environment"
        );

        StagedEnv { recorded }
    }
}

/// Recorded diff from applying an [`EnvSnapshot`]
#[derive(Debug)]
pub struct StagedEnv {
    /// Teardown keys with their pre-staging values (`None` = was unset)
    recorded: Vec<(String, Option<String>)>,
}

impl StagedEnv {
    /// Restore the recorded prior state of the teardown keys.
    pub fn revert(self) {
        for (key, prior) in self.recorded {
            match prior {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

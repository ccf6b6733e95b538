//! Credential-style file resolution
//!
//! Reads AWS-format INI credential files and returns environment entries
//! to be staged as *defaults* (an explicit process environment always
//! wins over file-derived values).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::InvokeError;

const ACCESS_KEY_VAR: &str = "AWS_ACCESS_KEY_ID";
const SECRET_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN_VAR: &str = "AWS_SESSION_TOKEN";

/// Profile selection: explicit option, then `AWS_PROFILE`, then
/// `AWS_DEFAULT_PROFILE`, then `default`.
pub fn resolve_profile(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("AWS_PROFILE").ok())
        .or_else(|| std::env::var("AWS_DEFAULT_PROFILE").ok())
        .unwrap_or_else(|| "default".to_string())
}

/// Load credential-derived environment defaults.
///
/// Search order: the default config location (`~/.aws/config`), the
/// default credentials location (`~/.aws/credentials`), then an
/// explicitly supplied path. Later files win key-by-key. Missing files
/// are skipped; a present but unparsable file is a load failure.
pub fn load_credentials(
    explicit: Option<&Path>,
    profile: Option<&str>,
) -> Result<HashMap<String, String>, InvokeError> {
    let profile = resolve_profile(profile);

    let mut paths: Vec<PathBuf> = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".aws").join("config"));
        paths.push(home.join(".aws").join("credentials"));
    }
    if let Some(path) = explicit {
        paths.push(path.to_path_buf());
    }

    let mut staged = HashMap::new();
    for path in &paths {
        if !path.is_file() {
            continue;
        }
        let section = read_profile(path, &profile)?;
        if let Some(vars) = section {
            debug!(path = %path.display(), profile = %profile, "Loaded credentials");
            staged.extend(vars);
        }
    }

    Ok(staged)
}

/// Parse one INI file and extract the named profile, if present.
///
/// Config-style files spell sections as `profile {name}`; both spellings
/// are consulted.
fn read_profile(
    path: &Path,
    profile: &str,
) -> Result<Option<HashMap<String, String>>, InvokeError> {
    let parsed: HashMap<String, HashMap<String, String>> = config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Ini))
        .build()
        .and_then(config::Config::try_deserialize)
        .map_err(|e| InvokeError::Load(format!("{}: {}", path.display(), e)))?;

    let section = parsed
        .get(profile)
        .or_else(|| parsed.get(&format!("profile {}", profile)));

    let Some(section) = section else {
        return Ok(None);
    };

    let mut vars = HashMap::new();
    for (key, value) in section {
        let value = value.clone();
        match key.as_str() {
            "aws_access_key_id" => {
                vars.insert(ACCESS_KEY_VAR.to_string(), value);
            }
            "aws_secret_access_key" => {
                vars.insert(SECRET_KEY_VAR.to_string(), value);
            }
            "aws_session_token" => {
                vars.insert(SESSION_TOKEN_VAR.to_string(), value);
            }
            "region" => {
                vars.insert(crate::env::REGION_VAR.to_string(), value);
            }
            _ => {}
        }
    }

    Ok(Some(vars))
}

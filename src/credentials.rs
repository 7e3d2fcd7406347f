//! Download API key loading.

use crate::core::error::{Error, Result};
use std::path::Path;

/// Read the API key from a credential file.
///
/// The file holds either the bare key or a line `api_key=<key>`. Blank lines
/// and lines starting with `#` are ignored.
pub fn load_api_key(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::CredentialLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut bare = None;
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "api_key" {
                return non_empty(path, value.trim());
            }
            continue;
        }
        bare.get_or_insert(line);
    }

    match bare {
        Some(key) => non_empty(path, key),
        None => Err(Error::CredentialLoad {
            path: path.to_path_buf(),
            reason: "no API key found".to_string(),
        }),
    }
}

fn non_empty(path: &Path, key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(Error::CredentialLoad {
            path: path.to_path_buf(),
            reason: "API key is empty".to_string(),
        });
    }
    Ok(key.to_string())
}

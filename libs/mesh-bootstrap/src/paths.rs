use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("HOME environment variable is not set")]
    HomeMissing,
}

/// Expand a leading `~` to the user's home directory.
///
/// Returns the path unchanged if no tilde prefix is present.
///
/// # Errors
/// [`HomeDirError::HomeMissing`] if the path starts with `~` and the home
/// directory is unknown.
pub fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    let home = || {
        env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .map_err(|_| HomeDirError::HomeMissing)
    };

    if raw == "~" {
        Ok(PathBuf::from(home()?))
    } else if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        Ok(Path::new(&home()?).join(rest))
    } else {
        Ok(PathBuf::from(raw))
    }
}

#![allow(dead_code)]

use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

/// Restores the named environment variables when dropped
pub struct EnvGuard {
    vars: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    #[must_use]
    pub fn new(vars: Vec<&'static str>) -> Self {
        let vars = vars
            .into_iter()
            .map(|var| (var, env::var(var).ok()))
            .collect();
        Self { vars }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        // Restore original environment state
        for (var, original_value) in &self.vars {
            match original_value {
                Some(value) => env::set_var(var, value),
                None => env::remove_var(var),
            }
        }
    }
}

/// Two endpoints served by `primary_url` and `backup_url`
#[must_use]
pub fn two_endpoint_toml(primary_url: &str, backup_url: &str) -> String {
    format!(
        r#"
[endpoints.primary]
url = "{primary_url}"
priority = 1
base_rate = 50.0
rate_range = [1.0, 100.0]
limit_hour = 1000

[endpoints.backup]
url = "{backup_url}"
priority = 2
base_rate = 50.0
rate_range = [1.0, 100.0]
"#
    )
}

/// Writes `contents` to `name` inside `dir`
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents)?;
    Ok(path)
}

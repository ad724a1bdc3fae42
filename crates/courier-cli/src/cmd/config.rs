//! `courier config` subcommands.

use crate::ui;
use courier_types::config::default_config_path;
use courier_types::CourierConfig;
use std::path::{Path, PathBuf};

fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path)
}

/// Print the effective configuration. Defaults fill in whatever the file
/// does not set.
pub fn cmd_config_show(explicit: Option<&Path>, config: &CourierConfig) {
    let path = config_path(explicit);
    match config.to_toml() {
        Ok(rendered) => {
            if path.exists() {
                println!("# {}\n", path.display());
            } else {
                println!("# {} (not found, showing defaults)\n", path.display());
            }
            println!("{rendered}");
        }
        Err(e) => {
            ui::error(&format!("Failed to render config: {e}"));
            std::process::exit(1);
        }
    }
}

pub fn cmd_config_path(explicit: Option<&Path>) {
    println!("{}", config_path(explicit).display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        assert_eq!(config_path(Some(&path)), path);
        assert_eq!(config_path(None), default_config_path());
    }
}

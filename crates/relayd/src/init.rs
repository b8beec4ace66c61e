// ABOUTME: `relayd init`: writes a default configuration file.
// ABOUTME: Refuses to overwrite an existing file unless forced.

use crate::config::Config;
use anyhow::Result;
use std::path::{Path, PathBuf};

pub fn run_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(Config::default_path);
    write_default_config(&path, force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayd.toml");
        write_default_config(&path, false).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayd.toml");
        std::fs::write(&path, "[pool]\nnum_workers = 1\n").unwrap();

        let err = write_default_config(&path, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(Config::load(&path).unwrap().pool.num_workers, 1);

        write_default_config(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }
}

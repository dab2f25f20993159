//! Single source of truth for the `<data-dir>` filesystem layout (spec §6).

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Layout {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl Layout {
    pub fn new(data_dir: impl Into<PathBuf>, db_path: Option<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let db_path = db_path.unwrap_or_else(|| data_dir.join("stats.db"));
        Self { data_dir, db_path }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn vpns_dir(&self) -> PathBuf {
        self.data_dir.join("vpns")
    }

    pub fn vpn_dir(&self, name: &str) -> PathBuf {
        self.vpns_dir().join(name)
    }

    pub fn units_dir(&self) -> PathBuf {
        self.data_dir.join("units")
    }

    pub fn unit_file(&self, name: &str) -> PathBuf {
        self.units_dir().join(format!("{name}.service"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn diagnostics_log(&self) -> PathBuf {
        self.logs_dir().join("diagnostics.log")
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.data_dir.join("updates")
    }

    pub fn update_tag_dir(&self, tag: &str) -> PathBuf {
        self.updates_dir().join(tag)
    }

    pub fn update_status_path(&self) -> PathBuf {
        self.data_dir.join("update-status.json")
    }

    pub fn update_job_path(&self) -> PathBuf {
        self.data_dir.join("update-job.json")
    }

    pub fn on_boot_dir(&self) -> PathBuf {
        self.data_dir.join("on_boot.d")
    }

    pub fn boot_hook_path(&self) -> PathBuf {
        self.on_boot_dir().join("10-split-vpn-webui.sh")
    }
}

/// Atomically write `contents` to `path` (write-tmp + rename, spec §5) with
/// the given unix mode.
pub async fn atomic_write(
    path: &Path,
    contents: &[u8],
    mode: u32,
) -> Result<(), std::io::Error> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
        set_mode(parent, 0o755).await.ok();
    }
    let tmp_path = path.with_extension(format!(
        "tmp-{}",
        rand::random::<u32>()
    ));
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.flush().await?;
    }
    set_mode(&tmp_path, mode).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), std::io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<(), std::io::Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_creates_parent_dirs_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.json");
        atomic_write(&path, b"{}", 0o600).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{}");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn atomic_write_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        atomic_write(&path, b"first", 0o644).await.unwrap();
        atomic_write(&path, b"second", 0o644).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
    }

    #[test]
    fn layout_paths_are_rooted_under_data_dir() {
        let layout = Layout::new("/data", None);
        assert_eq!(layout.settings_path(), Path::new("/data/settings.json"));
        assert_eq!(layout.vpn_dir("sgp"), Path::new("/data/vpns/sgp"));
        assert_eq!(layout.db_path, Path::new("/data/stats.db"));
    }
}

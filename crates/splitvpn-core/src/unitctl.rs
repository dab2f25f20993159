//! Systemd-shaped unit controller (SPEC_FULL.md §4.11).
//!
//! A narrow capability-set interface (spec §9) over the one piece of real
//! process control a profile needs beyond file I/O: starting, stopping, and
//! querying the service that brings its tunnel up. Grounded in the same
//! `Platform` trait shape as `wirewarden-daemon::netlink::Platform`.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use splitvpn_types::{Categorized, ErrorCategory};

use crate::layout::{atomic_write, Layout};
use crate::subprocess::{self, Logs};

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("unit controller not supported on this platform")]
    Unsupported,
    #[error(transparent)]
    Subprocess(#[from] subprocess::SubprocessError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Categorized for UnitError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
}

/// Service lifecycle for one profile's systemd-shaped unit.
pub trait UnitController: Send + Sync + 'static {
    fn start(&self, profile_name: &str) -> impl Future<Output = Result<(), UnitError>> + Send;
    fn stop(&self, profile_name: &str) -> impl Future<Output = Result<(), UnitError>> + Send;
    fn restart(&self, profile_name: &str) -> impl Future<Output = Result<(), UnitError>> + Send;
    fn is_active(
        &self,
        profile_name: &str,
    ) -> impl Future<Output = Result<bool, UnitError>> + Send;
}

fn unit_name(profile_name: &str) -> String {
    format!("split-vpn-webui@{profile_name}")
}

/// Writes canonical `units/<name>.service` files and the boot re-link hook,
/// and drives them through `systemctl` (spec §6 filesystem layout).
#[derive(Clone)]
pub struct SystemdUnitController {
    layout: std::sync::Arc<Layout>,
}

impl SystemdUnitController {
    pub fn new(layout: std::sync::Arc<Layout>) -> Self {
        Self { layout }
    }

    /// Write the canonical unit file for `profile_name` (mode 0644) and the
    /// boot hook that re-links units after a firmware upgrade (mode 0755).
    pub async fn write_unit_file(
        &self,
        profile_name: &str,
        config_path: &std::path::Path,
    ) -> Result<(), UnitError> {
        let unit = format!(
            "[Unit]\n\
             Description=split-vpn-webui managed tunnel ({profile_name})\n\
             After=network-online.target\n\
             Wants=network-online.target\n\n\
             [Service]\n\
             Type=simple\n\
             ExecStart=/usr/bin/wg-quick up {config}\n\
             ExecStop=/usr/bin/wg-quick down {config}\n\
             Restart=on-failure\n\n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            config = config_path.display(),
        );
        atomic_write(&self.layout.unit_file(&unit_name(profile_name)), unit.as_bytes(), 0o644)
            .await?;

        let hook = "#!/bin/sh\n\
             # re-links split-vpn-webui unit symlinks after a firmware upgrade\n\
             for unit in /data/split-vpn-webui/units/*.service; do\n\
             \tln -sf \"$unit\" /etc/systemd/system/\n\
             done\n\
             systemctl daemon-reload\n";
        atomic_write(&self.layout.boot_hook_path(), hook.as_bytes(), 0o755).await?;
        Ok(())
    }
}

impl UnitController for SystemdUnitController {
    async fn start(&self, profile_name: &str) -> Result<(), UnitError> {
        subprocess::run_silent(
            Command::new("systemctl").arg("start").arg(unit_name(profile_name)),
            SYSTEMCTL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn stop(&self, profile_name: &str) -> Result<(), UnitError> {
        subprocess::run_silent(
            Command::new("systemctl").arg("stop").arg(unit_name(profile_name)),
            SYSTEMCTL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn restart(&self, profile_name: &str) -> Result<(), UnitError> {
        subprocess::run_silent(
            Command::new("systemctl").arg("restart").arg(unit_name(profile_name)),
            SYSTEMCTL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn is_active(&self, profile_name: &str) -> Result<bool, UnitError> {
        let out = subprocess::run_stdout(
            Command::new("systemctl").arg("is-active").arg(unit_name(profile_name)),
            SYSTEMCTL_TIMEOUT,
            Logs::Suppress,
        )
        .await;
        Ok(matches!(out, Ok(s) if s.trim() == "active"))
    }
}

/// A no-op controller used where no real systemd is available (tests, or a
/// non-Linux dev box) — mirrors `wirewarden-daemon::netlink::StubPlatform`.
#[derive(Clone, Copy)]
pub struct NoopUnitController;

impl UnitController for NoopUnitController {
    async fn start(&self, _profile_name: &str) -> Result<(), UnitError> {
        Ok(())
    }
    async fn stop(&self, _profile_name: &str) -> Result<(), UnitError> {
        Ok(())
    }
    async fn restart(&self, _profile_name: &str) -> Result<(), UnitError> {
        Ok(())
    }
    async fn is_active(&self, _profile_name: &str) -> Result<bool, UnitError> {
        Ok(false)
    }
}

/// Runtime choice between the two controllers above, selected by `--systemd`
/// (spec §6 CLI). `VpnManager`/`BackupManager` are generic over `U:
/// UnitController` rather than a trait object, so the HTTP layer needs one
/// concrete type regardless of which controller the flag picks.
#[derive(Clone)]
pub enum AnyUnitController {
    Systemd(SystemdUnitController),
    Noop(NoopUnitController),
}

impl UnitController for AnyUnitController {
    async fn start(&self, profile_name: &str) -> Result<(), UnitError> {
        match self {
            AnyUnitController::Systemd(c) => c.start(profile_name).await,
            AnyUnitController::Noop(c) => c.start(profile_name).await,
        }
    }
    async fn stop(&self, profile_name: &str) -> Result<(), UnitError> {
        match self {
            AnyUnitController::Systemd(c) => c.stop(profile_name).await,
            AnyUnitController::Noop(c) => c.stop(profile_name).await,
        }
    }
    async fn restart(&self, profile_name: &str) -> Result<(), UnitError> {
        match self {
            AnyUnitController::Systemd(c) => c.restart(profile_name).await,
            AnyUnitController::Noop(c) => c.restart(profile_name).await,
        }
    }
    async fn is_active(&self, profile_name: &str) -> Result<bool, UnitError> {
        match self {
            AnyUnitController::Systemd(c) => c.is_active(profile_name).await,
            AnyUnitController::Noop(c) => c.is_active(profile_name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_controller_never_reports_active() {
        let ctl = NoopUnitController;
        ctl.start("sgp").await.unwrap();
        assert_eq!(ctl.is_active("sgp").await.unwrap(), false);
        ctl.stop("sgp").await.unwrap();
        ctl.restart("sgp").await.unwrap();
    }

    #[test]
    fn unit_name_is_namespaced_per_profile() {
        assert_eq!(unit_name("sgp"), "split-vpn-webui@sgp");
        assert_ne!(unit_name("sgp"), unit_name("us"));
    }

    #[tokio::test]
    async fn write_unit_file_sets_service_and_boot_hook_modes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = std::sync::Arc::new(Layout::new(dir.path(), None));
        let ctl = SystemdUnitController::new(std::sync::Arc::clone(&layout));
        ctl.write_unit_file("sgp", std::path::Path::new("/data/vpns/sgp/wg.conf"))
            .await
            .unwrap();

        let unit_path = layout.unit_file(&unit_name("sgp"));
        assert!(tokio::fs::metadata(&unit_path).await.is_ok());
        let contents = tokio::fs::read_to_string(&unit_path).await.unwrap();
        assert!(contents.contains("wg-quick up /data/vpns/sgp/wg.conf"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let hook_mode = tokio::fs::metadata(layout.boot_hook_path())
                .await
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(hook_mode & 0o777, 0o755);
        }
    }
}

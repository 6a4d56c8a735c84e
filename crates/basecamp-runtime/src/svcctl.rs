//! OS service registration.
//!
//! `run --install` / `run --uninstall` delegate here. Linux gets a systemd
//! unit under /etc/systemd/system; Windows goes through `sc.exe`. Anything
//! else is reported as unsupported. Both operations need elevated
//! privileges; a permission failure is surfaced as an error, not a panic.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

/// Register the current executable as an OS service that starts on boot.
pub fn service_install(service_name: &str, root_path: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("cannot determine current executable")?;
    tracing::info!(service = service_name, exe = %exe.display(), "installing OS service");

    if cfg!(target_os = "linux") {
        install_systemd_unit(service_name, &exe, root_path)
    } else if cfg!(windows) {
        let status = Command::new("sc")
            .args([
                "create",
                service_name,
                "binPath=",
                &format!("\"{}\" run", exe.display()),
                "start=",
                "auto",
            ])
            .status()
            .context("sc create failed to start")?;
        if !status.success() {
            bail!("sc create exited with {status}");
        }
        Ok(())
    } else {
        bail!("service install is not supported on this platform");
    }
}

/// Remove the OS service registration.
pub fn service_uninstall(service_name: &str) -> Result<()> {
    tracing::info!(service = service_name, "uninstalling OS service");

    if cfg!(target_os = "linux") {
        let unit_name = format!("{service_name}.service");
        let unit_path = Path::new("/etc/systemd/system").join(&unit_name);

        // stop/disable may fail if the unit never ran; that is fine
        let _ = Command::new("systemctl")
            .args(["disable", "--now", &unit_name])
            .status();
        if unit_path.exists() {
            std::fs::remove_file(&unit_path)
                .with_context(|| format!("removing {}", unit_path.display()))?;
        }
        let status = Command::new("systemctl")
            .args(["daemon-reload"])
            .status()
            .context("systemctl daemon-reload failed to start")?;
        if !status.success() {
            bail!("systemctl daemon-reload exited with {status}");
        }
        Ok(())
    } else if cfg!(windows) {
        let status = Command::new("sc")
            .args(["delete", service_name])
            .status()
            .context("sc delete failed to start")?;
        if !status.success() {
            bail!("sc delete exited with {status}");
        }
        Ok(())
    } else {
        bail!("service uninstall is not supported on this platform");
    }
}

fn install_systemd_unit(service_name: &str, exe: &Path, root_path: &Path) -> Result<()> {
    let unit_name = format!("{service_name}.service");
    let unit_path = Path::new("/etc/systemd/system").join(&unit_name);
    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());

    let unit_text = format!(
        "[Unit]\n\
         Description={service_name} (Basecamp agent)\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={exe} run\n\
         WorkingDirectory={root}\n\
         Restart=always\n\
         RestartSec=5\n\
         User={user}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe = exe.display(),
        root = root_path.display(),
    );

    std::fs::write(&unit_path, unit_text)
        .with_context(|| format!("writing {}", unit_path.display()))?;

    for args in [
        vec!["daemon-reload"],
        vec!["enable", "--now", unit_name.as_str()],
    ] {
        let status = Command::new("systemctl")
            .args(&args)
            .status()
            .with_context(|| format!("systemctl {args:?} failed to start"))?;
        if !status.success() {
            bail!("systemctl {args:?} exited with {status}");
        }
    }
    tracing::info!(unit = %unit_path.display(), "systemd unit installed");
    Ok(())
}

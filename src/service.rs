//! `timekeepd service` — systemd integration.
//!
//! Installs and manages a systemd unit that runs `timekeepd run` in the
//! background. Adapted from this corpus's existing install/uninstall
//! pattern (`systemctl` shelled out to via `std::process::Command`), pointed
//! at the time-synchronisation daemon instead.

use anyhow::Result;
use std::path::Path;
use std::process::Command;

const UNIT_PATH: &str = "/etc/systemd/system/timekeepd.service";

pub fn install(config_path: &Path) -> Result<()> {
    let already_active = Command::new("systemctl")
        .args(["is-active", "--quiet", "timekeepd"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);

    if already_active {
        println!("Service is already running.");
        println!();
        println!("  timekeepd service uninstall  — stop and remove the unit");
        println!("  systemctl status timekeepd   — check current state");
        return Ok(());
    }

    let binary = std::env::current_exe()?;
    let config_abs = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());

    let unit = format!(
        r#"[Unit]
Description=timekeepd — user-space time-synchronisation daemon
After=network.target

[Service]
Type=simple
User=root
ExecStart={binary} run --config {config} --foreground
Restart=always
RestartSec=5
StandardOutput=journal
StandardError=journal

[Install]
WantedBy=multi-user.target
"#,
        binary = binary.display(),
        config = config_abs.display(),
    );

    std::fs::write(UNIT_PATH, unit)?;

    let _ = Command::new("systemctl").arg("daemon-reload").status();
    let _ = Command::new("systemctl").args(["enable", "timekeepd"]).status();
    let _ = Command::new("systemctl").args(["start", "timekeepd"]).status();

    println!("Service installed, enabled, and started.");
    println!();
    println!("  systemctl status timekeepd  — view current state");
    println!("  journalctl -u timekeepd -f  — follow the log");

    Ok(())
}

pub fn uninstall() -> Result<()> {
    let _ = Command::new("systemctl").args(["stop", "timekeepd"]).status();
    let _ = Command::new("systemctl")
        .args(["disable", "timekeepd"])
        .status();
    std::fs::remove_file(UNIT_PATH)?;
    let _ = Command::new("systemctl").arg("daemon-reload").status();
    println!("Removed {}.", UNIT_PATH);
    Ok(())
}

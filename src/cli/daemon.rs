use anyhow::Result;
use console::style;
use std::path::Path;

use crate::core::terminal::{print_error, print_info, print_status, print_success, print_warn};
use crate::platform::{NativePlatform, Platform};

pub async fn gateway_start(run_dir: &Path, pid_file: &Path, args: &[String]) -> Result<()> {
    std::fs::create_dir_all(run_dir)?;
    NativePlatform::restrict_dir_permissions(run_dir);
    if pid_file.exists() && std::fs::read_to_string(pid_file).is_ok() {
        print_warn("Daemon is already running. Use 'gameforge gateway stop' first.");
        return Ok(());
    }

    let (api_host, api_port) = super::parse_api_server_flags(args, 3, None, None);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join("gameforge.log"))?;

    let exe = std::env::current_exe()?;
    let mut child_cmd = std::process::Command::new(exe);
    child_cmd.arg("daemon-run");
    if let Some(host) = &api_host {
        child_cmd.arg("--api-host").arg(host);
    }
    if let Some(port) = api_port {
        child_cmd.arg("--api-port").arg(port.to_string());
    }

    let child = child_cmd
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    std::fs::write(pid_file, child.id().to_string())?;
    NativePlatform::restrict_file_permissions(pid_file);

    print_success(&format!(
        "Gateway started ({})",
        style(format!("PID {}", child.id())).dim()
    ));
    print_status(
        "API Endpoint",
        &format!(
            "http://{}:{}",
            api_host.as_deref().unwrap_or("127.0.0.1"),
            api_port.unwrap_or(17950)
        ),
    );
    Ok(())
}

pub async fn gateway_stop(pid_file: &Path) -> Result<()> {
    if !pid_file.exists() {
        print_info("Gateway is not currently running.");
        return Ok(());
    }

    if let Ok(pid_str) = std::fs::read_to_string(pid_file) {
        let pid = pid_str.trim();
        if !pid.is_empty() {
            let _ = NativePlatform::kill_process(pid);
            print_success(&format!("Gateway stopped (was PID {})", pid));
        }
    }
    std::fs::remove_file(pid_file).ok();
    Ok(())
}

pub async fn gateway_status(pid_file: &Path) -> Result<()> {
    match std::fs::read_to_string(pid_file) {
        Ok(pid) => {
            let pid = pid.trim();
            print_status("Status", &format!("{} (PID {})", style("RUNNING").green(), pid));
        }
        Err(_) => {
            print_status("Status", &format!("{}", style("STOPPED").red()));
        }
    }
    Ok(())
}

pub fn follow_logs(run_dir: &Path) -> Result<()> {
    let log_path = run_dir.join("gameforge.log");
    if !log_path.exists() {
        print_error("No log file found. Is the gateway running?");
        return Ok(());
    }
    let mut child = NativePlatform::tail_file(&log_path)?;
    child.wait()?;
    Ok(())
}

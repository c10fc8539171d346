mod daemon;
mod serve;

use anyhow::Result;
use console::style;

use crate::core::terminal;
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();
    println!(" {}", style("Commands").bold());
    println!("   serve            Run the service in the foreground");
    println!("   gateway start    Start the background daemon");
    println!("   gateway stop     Stop the background daemon");
    println!("   gateway status   Show daemon status");
    println!("   logs             Follow the daemon log file");
    println!();
    println!(
        " {} {} <command> [--api-host HOST] [--api-port PORT]",
        style("Usage:").bold(),
        style("gameforge").green()
    );
    println!();
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: Option<String>,
    mut api_port: Option<u16>,
) -> (Option<String>, Option<u16>) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = NativePlatform::data_dir();
    let run_dir = data_dir.join("run");
    let pid_file = run_dir.join("gameforge.pid");

    match args.get(1).map(String::as_str) {
        Some("serve") => {
            let (host, port) = parse_api_server_flags(&args, 2, None, None);
            serve::serve_forever(host, port, false).await
        }
        // Internal entrypoint the gateway daemonizes into.
        Some("daemon-run") => {
            let (host, port) = parse_api_server_flags(&args, 2, None, None);
            serve::serve_forever(host, port, true).await
        }
        Some("gateway") => match args.get(2).map(String::as_str) {
            Some("start") => daemon::gateway_start(&run_dir, &pid_file, &args).await,
            Some("stop") => daemon::gateway_stop(&pid_file).await,
            Some("status") => daemon::gateway_status(&pid_file).await,
            _ => {
                print_help();
                Ok(())
            }
        },
        Some("logs") => daemon::follow_logs(&run_dir),
        _ => {
            print_help();
            Ok(())
        }
    }
}

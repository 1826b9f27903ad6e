//! vfprules - PA route rules for a freshly created switch port
//!
//! Reads `vfprules.json`, writes the equivalent vfpctrl commands to
//! `vfp-rules-<portid>.cmd` and, with `--apply`, adds the rules directly
//! through `vfpapi.dll`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::thread;
use std::time::Duration;

use clap::Parser;
use k2s_winhelpers::vfp::routes::VFPCTRL;
use k2s_winhelpers::vfp::{
    find_port_name, parse_gateway_mac, validate_port_id, MacAddress, RouteRule, VfpRoutes,
};
use k2s_winhelpers::{Error, Result};

const PORT_LOOKUP_ATTEMPTS: u32 = 30;

#[derive(Parser)]
#[command(name = "vfprules")]
#[command(about = "Add PA route rules to a VFP switch port")]
#[command(version)]
struct Cli {
    /// Id of the new port (GUID)
    #[arg(long)]
    portid: String,

    /// VFP port name; looked up with `vfpctrl /list-vmswitch-port` when omitted
    #[arg(long)]
    port: Option<String>,

    /// Switch the port belongs to
    #[arg(long, default_value = "")]
    switch: String,

    /// MAC to rewrite to for routes via a gateway, GATEWAY=MAC (repeatable)
    #[arg(long = "gateway", value_parser = parse_gateway_mac)]
    gateways: Vec<(String, MacAddress)>,

    /// Route file, defaults to vfprules.json next to the executable
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Directory receiving the vfpctrl command file
    #[arg(long, default_value = r"C:\var\log\vfprules")]
    log_dir: PathBuf,

    /// Also add the rules through vfpapi.dll
    #[arg(long)]
    apply: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal error in applying the vfp rules: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let port_id = validate_port_id(&cli.portid)?;
    tracing::info!("VFPRules started with portid: {}", port_id);

    let rules_path = match cli.rules {
        Some(path) => path,
        None => default_rules_path()?,
    };
    let routes = VfpRoutes::load(&rules_path)?;

    let port = match cli.port {
        Some(port) => port,
        None => lookup_port(&port_id.to_string())?,
    };
    tracing::debug!("Result of port name: '{}'", port);

    let gateways: HashMap<String, MacAddress> = cli.gateways.into_iter().collect();

    std::fs::create_dir_all(&cli.log_dir)?;
    let (path, written) = routes.write_command_file(&cli.log_dir, &port_id, &port, &gateways)?;
    tracing::info!("Wrote {} vfpctrl commands to {}", written, path.display());

    if cli.apply {
        apply(&routes.resolve_rules(&cli.switch, &port, &gateways))?;
    }
    Ok(())
}

fn default_rules_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::InvalidArgument(format!("no directory for {}", exe.display())))?;
    Ok(dir.join("vfprules.json"))
}

/// The port shows up in vfpctrl some time after it is created
fn lookup_port(port_id: &str) -> Result<String> {
    for attempt in 1..=PORT_LOOKUP_ATTEMPTS {
        match Command::new(VFPCTRL).arg("/list-vmswitch-port").output() {
            Ok(output) => {
                let listing = String::from_utf8_lossy(&output.stdout);
                if let Some(port) = find_port_name(&listing, port_id) {
                    return Ok(port);
                }
                tracing::debug!("No entry yet found for portid {} (attempt {})", port_id, attempt);
            }
            Err(e) => tracing::warn!("vfpctrl /list-vmswitch-port failed: {}", e),
        }
        thread::sleep(Duration::from_secs(1));
    }
    Err(Error::InvalidArgument(format!("port with id {port_id} was not found")))
}

#[cfg(windows)]
fn apply(rules: &[RouteRule]) -> Result<()> {
    use k2s_winhelpers::vfp::ffi::VfpApi;

    let api = VfpApi::load()?;
    let mut first_error = None;
    for rule in rules {
        match api.add_rule(rule) {
            Ok(()) => tracing::info!("Added rule {} for {}", rule.name, rule.destination),
            Err(e) => {
                tracing::warn!("Adding rule {} failed: {}", rule.name, e);
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(not(windows))]
fn apply(_rules: &[RouteRule]) -> Result<()> {
    Err(Error::InvalidArgument(
        "--apply needs vfpapi.dll, which only exists on Windows".into(),
    ))
}

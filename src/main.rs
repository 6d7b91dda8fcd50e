//! tetherd: tethering control plane daemon
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tetherd
//!
//! # Run with custom configuration
//! sudo ./tetherd -c /path/to/config.json
//!
//! # Run with environment overrides
//! TETHERD_LOG_LEVEL=debug sudo ./tetherd
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

use tetherd::config::{create_default_config, load_config_with_env, Config};
use tetherd::event::{EventSender, TetherEvent};
use tetherd::ipc::{IpcServer, PermissivePackageManager};
use tetherd::offload::NoOffloadHal;
use tetherd::orchestrator::{
    AllowAllEntitlement, Tethering, TetheringDeps, UnmanagedDownstreamDriver,
};
use tetherd::routing::linux::{interface_is_up, list_interfaces};
use tetherd::routing::{DnsmasqDhcpServer, LinuxNetd, UnsupportedDnsResolver};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tetherd/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tetherd v{}", tetherd::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tetherd v{}

Tethering control plane: downstream lifecycle, upstream selection,
private address coordination and 464xlat.

USAGE:
    tetherd [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tetherd/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TETHERD_LOG_LEVEL       Override log level (trace, debug, info, warn, error)
    TETHERD_IPC_SOCKET      Override IPC socket path
    TETHERD_SUPPORTED       Override the master tethering switch (0/1)
    TETHERD_FORCE_USB_NCM   Override the USB NCM function switch (0/1)

REQUIREMENTS:
    - CAP_NET_ADMIN (or root) for forwarding and interface configuration
    - iproute2 and iptables
    - dnsmasq for downstream DHCP
    - clatd for 464xlat (optional)
"#,
        tetherd::VERSION
    );
}

/// Initialize logging
///
/// Log level priority (highest to lowest):
/// 1. `RUST_LOG` environment variable
/// 2. Config file `log.level` setting (already merged with
///    `TETHERD_LOG_LEVEL` by the loader)
/// 3. Default: "info"
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Poll /sys/class/net and post interface appearance/loss and link state
/// changes onto the event bus.
fn spawn_interface_watcher(events: EventSender, interval: Duration) {
    tokio::spawn(async move {
        let mut known: std::collections::HashMap<String, bool> = std::collections::HashMap::new();
        loop {
            let mut present: std::collections::HashMap<String, bool> =
                std::collections::HashMap::new();
            for iface in list_interfaces() {
                present.insert(iface.clone(), interface_is_up(&iface));
            }

            for (iface, up) in &present {
                match known.get(iface) {
                    Some(was_up) if was_up == up => {}
                    _ => {
                        debug!("interface {iface} up={up}");
                        events.send(TetherEvent::InterfaceStateChanged {
                            iface: iface.clone(),
                            up: *up,
                        });
                    }
                }
            }
            for iface in known.keys() {
                if !present.contains_key(iface) {
                    events.send(TetherEvent::InterfaceStateChanged {
                        iface: iface.clone(),
                        up: false,
                    });
                }
            }

            known = present;
            tokio::time::sleep(interval).await;
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Default configuration written to {:?}", args.config_path);
        return Ok(());
    }

    let config = if args.config_path.exists() {
        load_config_with_env(&args.config_path)?
    } else {
        warn!("no configuration at {:?}, using defaults", args.config_path);
        Config::default_config()
    };

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    init_logging(&config);
    info!("tetherd v{} starting", tetherd::VERSION);

    let deps = TetheringDeps {
        netd: Arc::new(LinuxNetd::new()),
        resolver: Arc::new(UnsupportedDnsResolver),
        dhcp: Arc::new(DnsmasqDhcpServer::new()),
        offload_hal: Arc::new(NoOffloadHal),
        driver: Arc::new(UnmanagedDownstreamDriver),
        entitlement: Arc::new(AllowAllEntitlement),
        packages: Arc::new(PermissivePackageManager),
    };

    let mut tethering = Tethering::new(config.clone(), deps);
    let events = tethering.event_sender();

    let ipc = Arc::new(IpcServer::new(config.ipc.clone(), events.clone()));
    if config.ipc.enabled {
        let server = Arc::clone(&ipc);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!("IPC server exited: {e}");
            }
        });
    }

    spawn_interface_watcher(events.clone(), Duration::from_secs(2));

    let control_plane = tokio::spawn(async move {
        tethering.run().await;
    });

    signal::ctrl_c().await?;
    info!("shutdown requested");
    events.send(TetherEvent::Shutdown);
    ipc.shutdown();
    let _ = control_plane.await;

    info!("tetherd stopped");
    Ok(())
}

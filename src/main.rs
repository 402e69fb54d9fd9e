//! policy-router: apply one routing policy change
//!
//! This is the command-line front end for the route controller.
//!
//! # Usage
//!
//! ```bash
//! # Install the baseline rules
//! sudo ./policy-router init
//!
//! # Put wlan0 on network 100 and make it the default
//! sudo ./policy-router attach-network 100 wlan0
//! sudo ./policy-router add-route wlan0 0.0.0.0/0 --via 192.168.1.1
//! sudo ./policy-router attach-default wlan0
//!
//! # Run with environment overrides
//! POLICY_ROUTER_LOG_LEVEL=debug sudo ./policy-router -c /path/to/config.json flush wlan0
//! ```
//!
//! The exit status is 0 on success and the positive errno on a routing failure.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use policy_router::config::{load_config_with_env, Config};
use policy_router::controller::RouteController;
use policy_router::error::{PolicyRouterError, RouteError};
use policy_router::policy::{Permission, TableType};

/// One control operation
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Init,
    AttachNetwork {
        net_id: u16,
        interface: String,
        permission: Permission,
    },
    DetachNetwork {
        net_id: u16,
        interface: String,
        permission: Permission,
    },
    AttachVpn {
        net_id: u16,
        interface: String,
    },
    DetachVpn {
        net_id: u16,
        interface: String,
    },
    SetPermission {
        net_id: u16,
        interface: String,
        old: Permission,
        new: Permission,
    },
    AttachDefault {
        interface: String,
        permission: Permission,
    },
    DetachDefault {
        interface: String,
        permission: Permission,
    },
    AddRoute(RouteArgs),
    RemoveRoute(RouteArgs),
    Flush {
        interface: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteArgs {
    interface: String,
    destination: String,
    nexthop: Option<String>,
    table_type: TableType,
    uid: u32,
}

impl Command {
    fn parse(words: &[String]) -> Result<Self, String> {
        let (name, rest) = words
            .split_first()
            .ok_or_else(|| "missing command".to_string())?;
        let arg = |i: usize, what: &'static str| positional(rest, i, name, what);
        let permission_at = |i: usize| -> Result<Permission, String> {
            rest.get(i).map_or(Ok(Permission::None), |p| p.parse())
        };

        let most = match name.as_str() {
            "init" => 0,
            "attach-vpn" | "detach-vpn" | "attach-default" | "detach-default" => 2,
            "attach-network" | "detach-network" => 3,
            "set-permission" => 4,
            "flush" => 1,
            _ => usize::MAX,
        };
        if rest.len() > most {
            return Err(format!("{name}: unexpected argument: {}", rest[most]));
        }

        let command = match name.as_str() {
            "init" => Self::Init,
            "attach-network" | "detach-network" => {
                let net_id = parse_net_id(arg(0, "network id")?)?;
                let interface = arg(1, "interface")?.to_string();
                let permission = permission_at(2)?;
                if name == "attach-network" {
                    Self::AttachNetwork {
                        net_id,
                        interface,
                        permission,
                    }
                } else {
                    Self::DetachNetwork {
                        net_id,
                        interface,
                        permission,
                    }
                }
            }
            "attach-vpn" | "detach-vpn" => {
                let net_id = parse_net_id(arg(0, "network id")?)?;
                let interface = arg(1, "interface")?.to_string();
                if name == "attach-vpn" {
                    Self::AttachVpn { net_id, interface }
                } else {
                    Self::DetachVpn { net_id, interface }
                }
            }
            "set-permission" => Self::SetPermission {
                net_id: parse_net_id(arg(0, "network id")?)?,
                interface: arg(1, "interface")?.to_string(),
                old: arg(2, "old permission")?.parse()?,
                new: arg(3, "new permission")?.parse()?,
            },
            "attach-default" | "detach-default" => {
                let interface = arg(0, "interface")?.to_string();
                let permission = permission_at(1)?;
                if name == "attach-default" {
                    Self::AttachDefault {
                        interface,
                        permission,
                    }
                } else {
                    Self::DetachDefault {
                        interface,
                        permission,
                    }
                }
            }
            "add-route" | "remove-route" => {
                let route = RouteArgs::parse(rest)?;
                if name == "add-route" {
                    Self::AddRoute(route)
                } else {
                    Self::RemoveRoute(route)
                }
            }
            "flush" => Self::Flush {
                interface: arg(0, "interface")?.to_string(),
            },
            other => return Err(format!("unknown command: {other}")),
        };
        Ok(command)
    }

    fn run(&self, controller: &RouteController) -> Result<(), RouteError> {
        match self {
            Self::Init => controller.initialize(),
            Self::AttachNetwork {
                net_id,
                interface,
                permission,
            } => controller.attach_interface_to_network(*net_id, interface, *permission),
            Self::DetachNetwork {
                net_id,
                interface,
                permission,
            } => controller.detach_interface_from_network(*net_id, interface, *permission),
            Self::AttachVpn { net_id, interface } => {
                controller.attach_interface_to_vpn(*net_id, interface)
            }
            Self::DetachVpn { net_id, interface } => {
                controller.detach_interface_from_vpn(*net_id, interface)
            }
            Self::SetPermission {
                net_id,
                interface,
                old,
                new,
            } => controller.change_network_permission(*net_id, interface, *old, *new),
            Self::AttachDefault {
                interface,
                permission,
            } => controller.attach_to_default_network(interface, *permission),
            Self::DetachDefault {
                interface,
                permission,
            } => controller.detach_from_default_network(interface, *permission),
            Self::AddRoute(r) => controller.add_route(
                &r.interface,
                &r.destination,
                r.nexthop.as_deref(),
                r.table_type,
                r.uid,
            ),
            Self::RemoveRoute(r) => controller.remove_route(
                &r.interface,
                &r.destination,
                r.nexthop.as_deref(),
                r.table_type,
                r.uid,
            ),
            Self::Flush { interface } => controller.flush_routes(interface),
        }
    }
}

impl RouteArgs {
    fn parse(words: &[String]) -> Result<Self, String> {
        let mut words = words.iter();
        let interface = words.next().ok_or("route: missing interface")?.clone();
        let destination = words.next().ok_or("route: missing destination")?.clone();
        let mut nexthop = None;
        let mut table_type = TableType::Interface;
        let mut uid: u32 = 0;

        while let Some(word) = words.next() {
            let mut value = || {
                words
                    .next()
                    .ok_or_else(|| format!("route: {word} needs a value"))
            };
            match word.as_str() {
                "--via" => nexthop = Some(value()?.clone()),
                "--table" => table_type = value()?.parse()?,
                "--uid" => {
                    uid = value()?
                        .parse::<u32>()
                        .map_err(|e| format!("route: invalid uid: {e}"))?;
                }
                other => return Err(format!("route: unknown option: {other}")),
            }
        }

        Ok(Self {
            interface,
            destination,
            nexthop,
            table_type,
            uid,
        })
    }
}

fn positional<'a>(
    words: &'a [String],
    index: usize,
    command: &str,
    what: &str,
) -> Result<&'a str, String> {
    words
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("{command}: missing {what}"))
}

fn parse_net_id(s: &str) -> Result<u16, String> {
    s.parse()
        .map_err(|e| format!("invalid network id {s}: {e}"))
}

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Operation to apply
    command: Option<Command>,
}

impl Args {
    fn parse() -> Self {
        match Self::parse_from(std::env::args().skip(1)) {
            Ok(args) => args,
            Err(message) => {
                eprintln!("{message}");
                print_help();
                std::process::exit(1);
            }
        }
    }

    fn parse_from(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut args = args.into_iter();
        let mut config_path = PathBuf::from("/etc/policy-router/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut words = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    let path = args.next().ok_or_else(|| format!("{arg} needs a path"))?;
                    config_path = PathBuf::from(path);
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
                    println!("policy-router v{}", policy_router::VERSION);
                    std::process::exit(0);
                }
                _ => words.push(arg),
            }
        }

        let command = if words.is_empty() {
            None
        } else {
            Some(Command::parse(&words)?)
        };

        Ok(Self {
            config_path,
            generate_config,
            check_config,
            command,
        })
    }
}

fn print_help() {
    println!(
        r#"policy-router v{}

Policy-routing control plane: programs FIB rules and routing tables per network.

USAGE:
    policy-router [OPTIONS] <COMMAND> [ARGS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/policy-router/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

COMMANDS:
    init                                        Install the baseline rules
    attach-network <NETID> <IFACE> [PERM]       Route network NETID through IFACE
    detach-network <NETID> <IFACE> [PERM]       Undo attach-network and flush IFACE's table
    attach-vpn <NETID> <IFACE>                  Make IFACE the VPN for network NETID
    detach-vpn <NETID> <IFACE>                  Undo attach-vpn and flush IFACE's table
    set-permission <NETID> <IFACE> <OLD> <NEW>  Change the permission a network requires
    attach-default <IFACE> [PERM]               Make IFACE the default network
    detach-default <IFACE> [PERM]               Stop using IFACE as the default network
    add-route <IFACE> <PREFIX> [ROUTE OPTIONS]  Add a route
    remove-route <IFACE> <PREFIX> [ROUTE OPTIONS]
                                                Remove a route
    flush <IFACE>                               Remove every route in IFACE's table

    PERM is one of: none (default), network, system

ROUTE OPTIONS:
    --via <ADDR>            Nexthop (omit for a directly-connected route)
    --table <TYPE>          interface (default), legacy, privileged-legacy
    --uid <UID>             Requesting UID (legacy tables)

ENVIRONMENT:
    POLICY_ROUTER_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
    POLICY_ROUTER_IP_PATH          Override ip binary path
    POLICY_ROUTER_IPTABLES_PATH    Override iptables binary path
    POLICY_ROUTER_IP6TABLES_PATH   Override ip6tables binary path

REQUIREMENTS:
    - CAP_NET_ADMIN capability (or root)
"#,
        policy_router::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_writer(std::io::stderr);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites() {
    if !policy_router::is_root() {
        warn!("Not running as root; rule and route changes require CAP_NET_ADMIN");
    }
}

fn main() -> Result<()> {
    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        policy_router::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Handle check-config
    if args.check_config {
        load_config_with_env(&args.config_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to load configuration from {:?}: {}",
                args.config_path,
                e
            )
        })?;
        println!("Configuration is valid");
        return Ok(());
    }

    let Some(command) = args.command else {
        print_help();
        std::process::exit(1);
    };

    if let Err(e) = apply(&args.config_path, &command) {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Load the configuration, start logging, and apply one command.
fn apply(config_path: &Path, command: &Command) -> Result<(), PolicyRouterError> {
    let config = load_config_with_env(config_path)?;

    // Initialize logging
    init_logging(&config);

    info!("policy-router v{}", policy_router::VERSION);
    check_prerequisites();

    let controller = RouteController::from_config(&config);
    command.run(&controller).map_err(|e| {
        error!("{command:?} failed: {e}");
        e
    })?;

    Ok(())
}

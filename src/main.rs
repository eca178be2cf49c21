//! captive-portal: Captive portal gateway
//!
//! This is the main entry point for the gateway daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./captive-portal
//!
//! # Run with custom configuration
//! sudo ./captive-portal -c /path/to/config.json
//!
//! # Query a running instance
//! ./captive-portal --status
//!
//! # Produce a user-store entry
//! ./captive-portal --hash-password 's3cret'
//!
//! # Manage the user store named by the configuration
//! ./captive-portal --add-user alice 's3cret'
//! ./captive-portal --remove-user alice
//! ./captive-portal --list-users
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use captive_portal::auth::{hash_password, UserStore};
use captive_portal::config::{load_config_with_env, Config, LogConfig, DEFAULT_CONFIG_PATH};
use captive_portal::dns::DnsInterceptor;
use captive_portal::enforcer::build_enforcer;
use captive_portal::gateway::{GatewayHandler, GatewayServer, ServerOptions};
use captive_portal::ipc::{IpcClient, IpcCommand, IpcHandler, IpcResponse, IpcServer};
use captive_portal::portal::{Portal, Sweeper};
use captive_portal::session::{ProcArpTable, SessionAuthority};

/// Offline edits of the user store
enum UserCommand {
    Add { username: String, password: String },
    Remove { username: String },
    List,
}

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
    /// Query a running instance over IPC
    status: bool,
    /// Print a user-store hash for this password
    hash_password: Option<String>,
    /// Edit or list the user store and exit
    user_command: Option<UserCommand>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut check_config = false;
        let mut status = false;
        let mut hash_password = None;
        let mut user_command = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "--status" => {
                    status = true;
                }
                "--hash-password" => {
                    let Some(password) = args.next() else {
                        eprintln!("--hash-password requires a value");
                        std::process::exit(1);
                    };
                    hash_password = Some(password);
                }
                "--add-user" => {
                    let (Some(username), Some(password)) = (args.next(), args.next()) else {
                        eprintln!("--add-user requires a username and a password");
                        std::process::exit(1);
                    };
                    user_command = Some(UserCommand::Add { username, password });
                }
                "--remove-user" => {
                    let Some(username) = args.next() else {
                        eprintln!("--remove-user requires a username");
                        std::process::exit(1);
                    };
                    user_command = Some(UserCommand::Remove { username });
                }
                "--list-users" => {
                    user_command = Some(UserCommand::List);
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("captive-portal v{}", captive_portal::VERSION);
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
            check_config,
            status,
            hash_password,
            user_command,
        }
    }
}

fn print_help() {
    println!(
        r#"captive-portal v{}

Captive portal gateway: DNS interception, login portal and per-client
packet-filter enforcement.

USAGE:
    captive-portal [OPTIONS]

OPTIONS:
    -c, --config <PATH>        Configuration file path [default: {}]
    --check                    Check configuration and exit
    --status                   Print the status of a running instance and exit
    --hash-password <PW>       Print a user-store entry for PW and exit
    --add-user <NAME> <PW>     Add a user to the configured store and exit
    --remove-user <NAME>       Remove a user from the configured store and exit
    --list-users               List users in the configured store and exit
    -h, --help                 Print help information
    -v, --version              Print version information

ENVIRONMENT:
    CAPTIVE_PORTAL_GATEWAY_IP        Override the redirect address
    CAPTIVE_PORTAL_LOG_LEVEL         Override log level (trace, debug, info, warn, error)
    CAPTIVE_PORTAL_INTERFACE         Override the NAT egress interface
    CAPTIVE_PORTAL_SESSION_TIMEOUT   Override the session idle timeout (seconds)
    CAPTIVE_PORTAL_IPC_SOCKET        Override IPC socket path
    RUST_LOG                         Full tracing filter, takes precedence over the level

REQUIREMENTS:
    - root (or CAP_NET_ADMIN and CAP_NET_BIND_SERVICE)
    - iptables, conntrack and sysctl on PATH for the iptables backend
"#,
        captive_portal::VERSION,
        DEFAULT_CONFIG_PATH
    );
}

/// Initialize logging
fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target);

    if config.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites() {
    if !captive_portal::is_root() {
        warn!("Not running as root");
        warn!("Binding ports 53/80/443 and editing the packet filter require root");
        // Don't fail - let the bind or filter calls fail with a clearer error
    }
}

/// Print the status of a running instance
async fn query_status(config: &Config) -> Result<()> {
    let client = IpcClient::new(&config.ipc.socket_path);
    let response = client
        .send(IpcCommand::Status)
        .await
        .with_context(|| format!("Failed to reach portal at {:?}", config.ipc.socket_path))?;

    match response {
        IpcResponse::Status(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        IpcResponse::Error(e) => Err(anyhow::anyhow!("Portal returned an error: {e}")),
        other => Err(anyhow::anyhow!("Unexpected response: {other:?}")),
    }
}

/// Apply an offline user-store edit
///
/// A running portal loads the store at startup and must be restarted to
/// see the change.
fn edit_users(path: &Path, command: UserCommand) -> Result<()> {
    let mut store =
        UserStore::load(path).with_context(|| format!("Failed to load user store {path:?}"))?;

    match command {
        UserCommand::List => {
            for username in store.usernames() {
                println!("{username}");
            }
            return Ok(());
        }
        UserCommand::Add { username, password } => {
            store.add_user(&username, &password)?;
            println!("Added user {username}");
        }
        UserCommand::Remove { username } => {
            store.remove_user(&username)?;
            println!("Removed user {username}");
        }
    }

    store
        .save(path)
        .with_context(|| format!("Failed to write user store {path:?}"))
}

/// Shutdown handle for one spawned service
struct Service {
    name: &'static str,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Service {
    async fn stop(self, timeout: std::time::Duration) {
        let _ = self.shutdown.send(());
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            warn!(service = self.name, "Service did not stop in time");
        }
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    if let Some(password) = &args.hash_password {
        println!("{}", hash_password(password));
        return Ok(());
    }

    // Load configuration
    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!("Failed to load configuration from {:?}: {}", args.config_path, e)
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    if args.status {
        return query_status(&config).await;
    }

    if let Some(command) = args.user_command {
        return edit_users(&config.users_file, command);
    }

    init_logging(&config.log);

    info!("captive-portal v{}", captive_portal::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    check_prerequisites();

    // Credentials, packet filter and session authority
    let users = UserStore::load(&config.users_file)
        .map_err(|e| anyhow::anyhow!("Failed to load user store: {e}"))?;
    let enforcer = build_enforcer(&config.firewall);
    let portal = Arc::new(Portal::new(
        SessionAuthority::new(config.session.authority_config()),
        enforcer,
        Arc::new(users),
        Arc::new(ProcArpTable::new()),
    ));

    let handler = Arc::new(GatewayHandler::new(
        Arc::clone(&portal),
        config.session.cookie_name.clone(),
        config.session.timeout_secs,
    ));

    // Listeners. Any bind failure is fatal before anything is served and
    // reverts the filter baseline on the way out.
    let (dns, http, https) = portal
        .start(bind_listeners(&config, &handler))
        .await?;

    // IPC shutdown requests land here
    let (ipc_shutdown_tx, mut ipc_shutdown_rx) = mpsc::channel::<()>(1);

    let mut services = Vec::new();

    if let Some(dns) = &dns {
        let (tx, rx) = oneshot::channel();
        let runner = Arc::clone(dns);
        services.push(Service {
            name: "dns",
            shutdown: tx,
            handle: tokio::spawn(async move { runner.run_until_shutdown(rx).await }),
        });
    }

    for server in std::iter::once(&http).chain(https.as_ref()) {
        let (tx, rx) = oneshot::channel();
        let runner = Arc::clone(server);
        services.push(Service {
            name: if runner.is_secure() { "https" } else { "http" },
            shutdown: tx,
            handle: tokio::spawn(async move { runner.run_until_shutdown(rx).await }),
        });
    }

    let (sweep_tx, sweep_rx) = oneshot::channel();
    let sweeper = Sweeper::new(Arc::clone(&portal), config.session.sweep_interval());
    let sweeper_service = Service {
        name: "sweeper",
        shutdown: sweep_tx,
        handle: tokio::spawn(sweeper.run_until_shutdown(sweep_rx)),
    };

    let ipc_service = if config.ipc.enabled {
        let mut ipc_handler = IpcHandler::new(Arc::clone(&portal))
            .with_gateway_stats(
                Some(Arc::clone(http.stats())),
                https.as_ref().map(|s| Arc::clone(s.stats())),
            )
            .with_shutdown(ipc_shutdown_tx);
        if let Some(dns) = &dns {
            ipc_handler = ipc_handler.with_dns_stats(Arc::clone(dns.stats()));
        }

        match IpcServer::bind(&config.ipc, Arc::new(ipc_handler)) {
            Ok(server) => {
                let (tx, rx) = oneshot::channel();
                Some(Service {
                    name: "ipc",
                    shutdown: tx,
                    handle: tokio::spawn(server.run_until_shutdown(rx)),
                })
            }
            Err(e) => {
                error!(error = %e, "IPC server unavailable, continuing without it");
                None
            }
        }
    } else {
        drop(ipc_shutdown_tx);
        None
    };

    info!(
        gateway_ip = %config.gateway_ip,
        http = %http.local_addr(),
        https = ?https.as_ref().map(|s| s.local_addr()),
        dns = ?dns.as_ref().map(|d| d.local_addr()),
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        Some(()) = ipc_shutdown_rx.recv() => {
            info!("Shutdown requested over IPC, initiating shutdown...");
        }
    }

    // Stop accepting new work
    let drain = config.shutdown_drain();
    for service in services {
        service.stop(drain).await;
    }
    sweeper_service.stop(drain).await;

    // Bounded wait for requests and queries already in flight
    if let Some(dns) = &dns {
        dns.drain(drain).await;
    }
    http.drain(drain).await;
    if let Some(https) = &https {
        https.drain(drain).await;
    }

    // Revoke every session, then open the filter back up
    let revoked = portal.revoke_all().await;
    info!(count = revoked.len(), "Revoked remaining sessions");

    if let Err(e) = portal.teardown().await {
        error!(error = %e, "Packet filter teardown incomplete");
    }

    if let Some(ipc) = ipc_service {
        ipc.stop(drain).await;
    }

    let stats = portal.stats().snapshot();
    info!(
        "Final stats: {} logins, {} failed logins, {} logouts, {} enforcement failures",
        stats.logins, stats.login_failures, stats.logouts, stats.enforcement_failures
    );
    info!("Shutdown complete");

    Ok(())
}

/// Bind the optional HTTPS listener
type Listeners = (
    Option<Arc<DnsInterceptor>>,
    Arc<GatewayServer>,
    Option<Arc<GatewayServer>>,
);

/// Bind the DNS interceptor and the HTTP(S) gateway
async fn bind_listeners(config: &Config, handler: &Arc<GatewayHandler>) -> Result<Listeners> {
    let dns = if config.dns.enabled {
        let interceptor = DnsInterceptor::from_config(&config.dns, config.gateway_ip)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Some(Arc::new(interceptor))
    } else {
        info!("DNS interceptor disabled");
        None
    };

    let http = GatewayServer::bind(
        config.http.listen,
        Arc::clone(handler),
        ServerOptions::from(&config.http),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    let https = bind_https(config, handler).await?;

    Ok((dns, Arc::new(http), https))
}

#[cfg(feature = "tls")]
async fn bind_https(
    config: &Config,
    handler: &Arc<GatewayHandler>,
) -> Result<Option<Arc<GatewayServer>>> {
    let Some(tls) = &config.http.tls else {
        return Ok(None);
    };

    let acceptor = captive_portal::gateway::create_tls_acceptor(tls)
        .map_err(|e| anyhow::anyhow!("Failed to load TLS certificate/key: {e}"))?;
    let server = GatewayServer::bind_tls(
        tls.listen,
        Arc::clone(handler),
        ServerOptions::from(&config.http),
        acceptor,
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(Some(Arc::new(server)))
}

#[cfg(not(feature = "tls"))]
async fn bind_https(
    config: &Config,
    _handler: &Arc<GatewayHandler>,
) -> Result<Option<Arc<GatewayServer>>> {
    if config.http.tls.is_some() {
        anyhow::bail!("http.tls is configured but this build lacks the `tls` feature");
    }
    Ok(None)
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}

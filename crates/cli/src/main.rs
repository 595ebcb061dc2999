use clap::Parser;
use dnsmasq_rs_domain::Hostfile;
use dnsmasq_rs_infrastructure::dns::{server, DnsServer, Forwarder, NetExchanger, RequestHandler};
use dnsmasq_rs_infrastructure::hosts::{EmptyHostfile, HostsFile};
use dnsmasq_rs_infrastructure::{resolvconf, Metrics, ResponseCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod bootstrap;

#[derive(Parser, Debug)]
#[command(name = "dnsmasq-rs")]
#[command(version)]
#[command(about = "Lightweight caching DNS forwarder for containerised applications")]
pub(crate) struct Cli {
    /// Listen address: `host[:port]`
    #[arg(short = 'l', long, env = "DNSMASQ_LISTEN", default_value = "127.0.0.1:53")]
    listen: String,

    /// Make this process the default name server (rewrites /etc/resolv.conf)
    #[arg(short = 'd', long, env = "DNSMASQ_DEFAULT")]
    default_resolver: bool,

    /// Comma-separated list of nameservers: `host[:port]`
    #[arg(short = 'n', long, env = "DNSMASQ_SERVERS")]
    nameservers: Option<String>,

    /// Domains resolved through specific nameservers: `dom[,dom]/host[,host]`
    #[arg(short = 'z', long = "stubzones", env = "DNSMASQ_STUB")]
    stubzones: Vec<String>,

    /// Path to a hosts file or a directory of hosts files
    #[arg(short = 'f', long, env = "DNSMASQ_HOSTSFILE")]
    hostsfile: Option<PathBuf>,

    /// Hosts file poll interval in seconds; 0 disables polling
    #[arg(short = 'p', long = "hostsfile-poll", env = "DNSMASQ_POLL", default_value_t = 0)]
    hostsfile_poll: u64,

    /// SEARCH domains taking precedence over /etc/resolv.conf: `fqdn[,fqdn]`
    #[arg(short = 's', long = "search-domains", env = "DNSMASQ_SEARCH")]
    search_domains: Option<String>,

    /// Qualify short names with the SEARCH domains
    #[arg(short = 'a', long = "enable-search", env = "DNSMASQ_ENABLE_SEARCH")]
    enable_search: bool,

    /// Response cache capacity in messages; 0 disables the cache
    #[arg(long = "rcache", env = "DNSMASQ_RCACHE", default_value_t = 0)]
    rcache: usize,

    /// Response cache entry TTL in seconds
    #[arg(long = "rcache-ttl", env = "DNSMASQ_RCACHE_TTL", default_value_t = 60)]
    rcache_ttl: u64,

    /// Disable recursion
    #[arg(long = "no-rec", env = "DNSMASQ_NOREC")]
    no_rec: bool,

    /// Minimum label count before a name is forwarded at all
    #[arg(long = "fwd-ndots", env = "DNSMASQ_FWD_NDOTS", default_value_t = 1)]
    fwd_ndots: u32,

    /// Minimum label count before a name is tried as-is upstream
    #[arg(long = "ndots", env = "DNSMASQ_NDOTS", default_value_t = 1)]
    ndots: u32,

    /// Shuffle A/AAAA answer records
    #[arg(long = "round-robin", env = "DNSMASQ_RR")]
    round_robin: bool,

    /// Adopt socket(s) activated by systemd (ignores --listen)
    #[arg(long, env = "DNSMASQ_SYSTEMD")]
    systemd: bool,

    /// Enable verbose logging
    #[arg(long, env = "DNSMASQ_VERBOSE")]
    verbose: bool,

    /// Log without timestamps and colour, for capture by a system logger
    #[arg(long, env = "DNSMASQ_SYSLOG")]
    syslog: bool,

    /// Run the multi-threaded scheduler
    #[arg(
        long,
        env = "DNSMASQ_MULTITHREADING",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    multithreading: bool,
}

fn main() {
    let cli = Cli::parse();
    bootstrap::init_logging(cli.verbose, cli.syslog);

    let runtime = match build_runtime(cli.multithreading) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build the async runtime");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

fn build_runtime(multithreading: bool) -> std::io::Result<tokio::runtime::Runtime> {
    if multithreading {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("dnsmasq-worker")
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(bootstrap::build_config(&cli)?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.dns_addr,
        nameservers = ?config.nameservers,
        "starting dnsmasq-rs"
    );

    let shutdown = CancellationToken::new();

    let hosts: Arc<dyn Hostfile> = match &config.hostsfile {
        Some(path) => {
            let store = HostsFile::new(path)?;
            if config.poll_interval > 0 {
                store.clone().spawn_watcher(
                    Duration::from_secs(config.poll_interval),
                    shutdown.clone(),
                );
            }
            store
        }
        None => Arc::new(EmptyHostfile),
    };

    let metrics = Arc::new(Metrics::new());
    let cache = ResponseCache::new(
        config.rcache_capacity,
        Duration::from_secs(config.rcache_ttl),
    );
    let exchanger = Arc::new(NetExchanger::new(2 * config.read_timeout));
    let forwarder = Forwarder::new(config.clone(), exchanger, metrics.clone())?;
    let handler = Arc::new(RequestHandler::new(
        config.clone(),
        cache,
        hosts,
        forwarder,
        metrics,
        env!("CARGO_PKG_VERSION"),
    ));

    let listeners = if config.systemd {
        server::systemd_listeners()?
    } else {
        server::bind(config.dns_addr)?
    };

    if config.default_resolver {
        let path = Path::new(resolvconf::RESOLVCONF_PATH);
        match resolvconf::store_address(config.dns_addr.ip(), path) {
            Ok(()) => info!("registered as the default resolver"),
            Err(err) => warn!(error = %err, "failed to register as default resolver"),
        }
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = wait_for_signal().await {
                error!(error = %err, "failed to install signal handlers");
            }
            shutdown.cancel();
        });
    }

    let result = DnsServer::new(handler).run(listeners, shutdown).await;

    if config.default_resolver {
        if let Err(err) = resolvconf::clean(Path::new(resolvconf::RESOLVCONF_PATH)) {
            warn!(error = %err, "failed to restore resolv.conf");
        }
    }

    result?;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = sigint.recv() => info!("exit requested by signal: SIGINT"),
        _ = sigterm.recv() => info!("exit requested by signal: SIGTERM"),
        _ = sigquit.recv() => info!("exit requested by signal: SIGQUIT"),
    }
    Ok(())
}

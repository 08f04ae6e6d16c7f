mod command;
mod ui;

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::{EnvFilter, fmt};

use zget_core::config::ZgetConfig;
use zget_engine::ShareRequest;

use crate::command::{run_get, run_put};

/// zget: password-protected file drop for the local network.
///
/// `zget put` announces a file over mDNS and serves it once; `zget get`
/// finds the peer announcing the same file name and downloads it.
#[derive(Parser, Debug)]
#[command(name = "zget", version, about)]
struct Cli {
    /// More log output (`-v` debug, `-vv` trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Hide the progress bar.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a file announced by a peer.
    Get {
        /// Name the sender shares the file under.  A random alias is
        /// generated when omitted.
        filename: Option<String>,
        /// Where to write the file.  Defaults to the file name in the
        /// working directory.
        output: Option<PathBuf>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Announce a file and serve it to the first peer that asks.
    Put {
        /// File to share.
        input: PathBuf,
        /// Extra name the file can be fetched under.  Generated when
        /// omitted.
        alias: Option<String>,
        /// Port to listen on (default: from config, else OS-assigned).
        #[arg(short = 'P', long)]
        port: Option<u16>,
        /// Address to listen on and announce.
        #[arg(short, long, conflicts_with = "interface")]
        address: Option<IpAddr>,
        /// Network interface whose IPv4 address is announced.
        #[arg(short, long)]
        interface: Option<String>,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Give up after this many seconds.
    #[arg(short, long, value_parser = parse_timeout)]
    timeout: Option<Duration>,

    /// Shared password.  Prompted for when omitted.
    #[arg(short, long, conflicts_with = "bypass_encryption")]
    password: Option<String>,

    /// Disable encryption and peer authentication.
    #[arg(long)]
    bypass_encryption: bool,
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("{value:?} is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("{value:?} is not a valid timeout"))
}

fn log_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "zget_cli=info,zget_engine=info,warn",
            1 => "debug",
            _ => "trace",
        })
    })
}

/// Cancels `cancel` on the first interrupt.  Returns `true` once a second
/// interrupt arrives.
async fn watch_interrupts<F, Fut>(mut interrupt: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    warn!("Interrupted, press Ctrl-C again to quit immediately");
    cancel.cancel();
    interrupt().await.is_ok()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so a progress bar on stdout stays readable.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(cli.verbose))
        .init();

    let config = match ZgetConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };
    debug!(?config, "Loaded configuration");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if watch_interrupts(tokio::signal::ctrl_c, cancel).await {
                error!("Interrupted twice, quitting");
                std::process::exit(130);
            }
        });
    }

    let result = match cli.command {
        Command::Get {
            filename,
            output,
            common,
        } => run_get(filename, output, &common, &config, cli.quiet, &cancel).await,
        Command::Put {
            input,
            alias,
            port,
            address,
            interface,
            common,
        } => {
            let interface = if address.is_some() {
                None
            } else {
                interface.or_else(|| config.interface.clone())
            };
            let request = ShareRequest {
                path: input,
                alias,
                address,
                interface,
                port: port.unwrap_or(config.port),
                timeout: common.timeout,
            };
            run_put(request, &common, cli.quiet, &cancel).await
        }
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

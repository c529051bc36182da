//! # cmb — Concurrent Multipath Bulk transfer
//!
//! ```bash
//! # Serve a file on two endpoints; prints the resource id.
//! cmb server -a 192.0.2.10 -a 192.0.2.11 -p 9999 big.iso
//!
//! # Fetch over two flows, forward and reverse.
//! cmb client -a 192.0.2.10 -a 192.0.2.11 -p 9999 <RESOURCE_ID> out.iso
//! ```

use anyhow::{Context, Result};
use cmb_cli::{client, server};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use cmb_transport::resource::ResourceId;
use cmb_transport::DEFAULT_SENDING_RATE;

const DEFAULT_IP_ADDR: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9999;

#[derive(Parser)]
#[command(name = "cmb", version, about = "Concurrent multipath bulk transfer over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a file on one or more endpoints.
    Server {
        /// Listen address; repeat for multiple endpoints.
        #[arg(short = 'a', long = "address")]
        addresses: Vec<String>,
        /// Listen port; repeat for multiple endpoints.
        #[arg(short = 'p', long = "port")]
        ports: Vec<String>,
        /// Enable debug logging.
        #[arg(short, long)]
        verbose: bool,
        /// File to serve.
        file: PathBuf,
    },
    /// Fetch a resource to a file (or `-` for stdout).
    Client {
        /// Provider address; with two, the second flow runs in reverse.
        #[arg(short = 'a', long = "address")]
        addresses: Vec<String>,
        /// Provider port; repeat per endpoint.
        #[arg(short = 'p', long = "port")]
        ports: Vec<String>,
        /// Per-flow sending rate in bytes per second.
        #[arg(short = 'r', long = "rate")]
        rates: Vec<String>,
        /// Enable debug logging.
        #[arg(short, long)]
        verbose: bool,
        /// 48-hex-character resource id printed by the server.
        resource_id: String,
        /// Output path, or `-` for stdout.
        output: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let verbose = match &cli.command {
        Command::Server { verbose, .. } | Command::Client { verbose, .. } => *verbose,
    };
    init_logging(verbose);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    match cli.command {
        Command::Server {
            addresses,
            ports,
            file,
            ..
        } => {
            let endpoints = resolve_endpoints(&addresses, &ports)?;
            let data = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            runtime.block_on(run_server(data, endpoints))
        }
        Command::Client {
            addresses,
            ports,
            rates,
            resource_id,
            output,
            ..
        } => {
            let endpoints = resolve_endpoints(&addresses, &ports)?;
            if endpoints.len() > 2 {
                anyhow::bail!(
                    "expected at most 2 endpoints, {} were given",
                    endpoints.len()
                );
            }
            let rates = resolve_rates(&rates, endpoints.len())?;
            let resource_id = ResourceId::from_hex(&resource_id)
                .map_err(|error| anyhow::anyhow!("{resource_id} is not a valid resource id: {error}"))?;

            let flows: Vec<client::FlowSpec> = endpoints
                .iter()
                .zip(rates)
                .enumerate()
                .map(|(index, (address, sending_rate))| client::FlowSpec {
                    address: *address,
                    sending_rate,
                    // The first endpoint fetches forward, the second reverse.
                    reverse: index == 1,
                })
                .collect();

            let resource = runtime.block_on(client::fetch(resource_id, flows))?;
            write_output(&output, &resource)
        }
    }
}

async fn run_server(data: Vec<u8>, endpoints: Vec<SocketAddr>) -> Result<()> {
    let resource = server::ServedResource::prepare(&data);
    let bound = server::Server::bind(resource, &endpoints).await?;
    // The fetcher identifies the resource by this id.
    println!("{}", bound.resource_id);
    bound.run().await
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Pair up addresses and ports. A single value on either side is broadcast
/// across the other; anything else must match in count.
fn resolve_endpoints(addresses: &[String], ports: &[String]) -> Result<Vec<SocketAddr>> {
    let mut addresses: Vec<String> = if addresses.is_empty() {
        vec![DEFAULT_IP_ADDR.to_string()]
    } else {
        addresses.to_vec()
    };
    let mut ports: Vec<String> = if ports.is_empty() {
        vec![DEFAULT_PORT.to_string()]
    } else {
        ports.to_vec()
    };

    if addresses.len() == 1 && ports.len() > 1 {
        addresses = vec![addresses[0].clone(); ports.len()];
    }
    if ports.len() == 1 && addresses.len() > 1 {
        ports = vec![ports[0].clone(); addresses.len()];
    }
    if addresses.len() != ports.len() {
        anyhow::bail!(
            "expected the number of addresses to match the number of ports, \
             or one of them to be a single value"
        );
    }

    let mut endpoints = Vec::with_capacity(addresses.len());
    for (address, port) in addresses.iter().zip(&ports) {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| anyhow::anyhow!("{address} is not a valid IPv4 or IPv6 address"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("{port} is not a valid port number"))?;
        if port < 1024 {
            anyhow::bail!("{port} is not within the valid port range [1024, 65535]");
        }
        endpoints.push(SocketAddr::new(ip, port));
    }
    Ok(endpoints)
}

/// Per-flow sending rates, broadcast like addresses and ports.
fn resolve_rates(rates: &[String], flow_count: usize) -> Result<Vec<u32>> {
    let rates: Vec<String> = if rates.is_empty() {
        vec![DEFAULT_SENDING_RATE.to_string()]
    } else {
        rates.to_vec()
    };
    let rates: Vec<String> = if rates.len() == 1 && flow_count > 1 {
        vec![rates[0].clone(); flow_count]
    } else {
        rates
    };
    if rates.len() != flow_count {
        anyhow::bail!(
            "expected {} sending rates, {} were given",
            flow_count,
            rates.len()
        );
    }
    rates
        .iter()
        .map(|rate| {
            let parsed: u32 = rate
                .parse()
                .map_err(|_| anyhow::anyhow!("{rate} is not a valid sending rate"))?;
            if parsed == 0 {
                anyhow::bail!("sending rate must be positive");
            }
            Ok(parsed)
        })
        .collect()
}

fn write_output(output: &str, resource: &[u8]) -> Result<()> {
    if output == "-" {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(resource).context("write to stdout")?;
        stdout.flush().context("flush stdout")?;
    } else {
        std::fs::write(output, resource)
            .with_context(|| format!("failed to write {output}"))?;
    }
    Ok(())
}

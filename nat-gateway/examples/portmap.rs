//! Maps, unmaps and lists ports on the gateway of the local network.
//!
//! ## Usage
//!
//! Map TCP port 25565 with UPnP:
//!
//!     cargo run --example portmap --features=examples -- upnp map 25565
//!
//! List the mappings the gateway holds for this host:
//!
//!     cargo run --example portmap --features=examples -- upnp list --local
//!
//! Ask a NAT-PMP gateway for its external address:
//!
//!     cargo run --example portmap --features=examples -- pmp 192.168.1.1 external
//!
//! Set `RUST_LOG=nat_gateway=debug` to see what is sent on the wire.

use std::{net::Ipv4Addr, time::Duration};

use clap::{Parser, Subcommand};
use n0_snafu::Result;
use nat_gateway::{
    mapping::{Endpoint, Protocol},
    nat_pmp,
    upnp::{self, DescriptionFilter, MapOptions, MappingFilter, UnmapOptions},
};
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Parser)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Talk to an UPnP Internet Gateway Device.
    Upnp {
        /// Only search on the interface with this name.
        #[clap(long)]
        interface: Option<String>,
        /// How long to wait for the gateway to answer, in milliseconds.
        #[clap(long, default_value_t = 1800)]
        timeout_ms: u64,
        #[clap(subcommand)]
        command: UpnpCommand,
    },
    /// Talk to a NAT-PMP gateway.
    Pmp {
        /// Address of the gateway.
        gateway: Ipv4Addr,
        /// How long to wait for each answer, in milliseconds.
        #[clap(long, default_value_t = 3000)]
        timeout_ms: u64,
        #[clap(subcommand)]
        command: PmpCommand,
    },
}

#[derive(Debug, Subcommand)]
enum UpnpCommand {
    /// Create a mapping.
    Map {
        /// Public port, optionally as `host:port`.
        public: Endpoint,
        /// Private port, optionally as `host:port`.
        private: Option<Endpoint>,
        #[clap(long, default_value = "tcp")]
        protocol: Protocol,
        #[clap(long)]
        description: Option<String>,
        /// Lease in seconds.
        #[clap(long)]
        ttl: Option<u32>,
    },
    /// Remove a mapping.
    Unmap {
        public: Endpoint,
        #[clap(long, default_value = "tcp")]
        protocol: Protocol,
    },
    /// List the mappings held by the gateway.
    List {
        /// Only mappings of this host.
        #[clap(long)]
        local: bool,
        /// Only mappings whose description matches this expression.
        #[clap(long)]
        description: Option<regex::Regex>,
    },
    /// Print the external address of the gateway.
    External,
}

#[derive(Debug, Subcommand)]
enum PmpCommand {
    /// Create a mapping.
    Map {
        private_port: u16,
        /// Suggested public port, the gateway picks one when `0`.
        #[clap(default_value_t = 0)]
        public_port: u16,
        #[clap(long, default_value = "tcp")]
        protocol: Protocol,
        /// Lifetime in seconds.
        #[clap(long)]
        ttl: Option<u32>,
    },
    /// Remove a mapping.
    Unmap {
        private_port: u16,
        #[clap(long, default_value = "tcp")]
        protocol: Protocol,
    },
    /// Print the external address of the gateway.
    External,
}

// set the RUST_LOG env var to one of {debug,info,warn} to see logging info
fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result {
    setup_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Upnp {
            interface,
            timeout_ms,
            command,
        } => {
            let client = upnp::Client::new(upnp::ssdp::Options {
                interface,
                ..Default::default()
            })?
            .discovery_timeout(Duration::from_millis(timeout_ms));
            let res = run_upnp(&client, command).await;
            client.destroy();
            res
        }
        Command::Pmp {
            gateway,
            timeout_ms,
            command,
        } => {
            let config = nat_pmp::Config::new(gateway)
                .recv_timeout(Some(Duration::from_millis(timeout_ms)));
            let client = nat_pmp::Client::with_config(config)?;
            let res = run_pmp(&client, command).await;
            client.close();
            res
        }
    }
}

async fn run_upnp(client: &upnp::Client, command: UpnpCommand) -> Result {
    match command {
        UpnpCommand::Map {
            public,
            private,
            protocol,
            description,
            ttl,
        } => {
            let mut options = MapOptions::new(public.clone()).protocol(protocol);
            options.private = private;
            options.description = description;
            options.ttl = ttl;
            client.map(options).await?;
            println!("mapped {protocol} {public}");
        }
        UpnpCommand::Unmap { public, protocol } => {
            client
                .unmap(UnmapOptions::new(public.clone()).protocol(protocol))
                .await?;
            println!("unmapped {protocol} {public}");
        }
        UpnpCommand::List { local, description } => {
            let filter = MappingFilter {
                local,
                description: description.map(DescriptionFilter::Regex),
            };
            for entry in client.mappings(filter).await? {
                println!(
                    "{} {}:{} -> {}:{} {:?} ttl={}s{}",
                    entry.protocol,
                    entry.public_host.as_deref().unwrap_or("*"),
                    entry.public_port,
                    entry.private_host,
                    entry.private_port,
                    entry.description,
                    entry.ttl_seconds,
                    if entry.enabled { "" } else { " (disabled)" },
                );
            }
        }
        UpnpCommand::External => {
            let gateway = client.find_gateway().await?;
            println!("gateway: {}", gateway.device.url());
            println!("external address: {}", client.external_ip().await?);
        }
    }
    Ok(())
}

async fn run_pmp(client: &nat_pmp::Client, command: PmpCommand) -> Result {
    match command {
        PmpCommand::Map {
            private_port,
            public_port,
            protocol,
            ttl,
        } => {
            let mut request = nat_pmp::MapRequest::new(protocol, private_port, public_port);
            request.ttl = ttl;
            let mapping = client.map(request).await?;
            println!(
                "mapped {} {} -> {} for {}s",
                mapping.protocol,
                mapping.public_port,
                mapping.private_port,
                mapping.lifetime_seconds
            );
        }
        PmpCommand::Unmap {
            private_port,
            protocol,
        } => {
            client
                .unmap(nat_pmp::MapRequest::new(protocol, private_port, 0))
                .await?;
            println!("unmapped {protocol} {private_port}");
        }
        PmpCommand::External => {
            let external = client.external_address().await?;
            println!(
                "external address: {} (gateway up for {}s)",
                external.ip, external.epoch_time
            );
        }
    }
    Ok(())
}

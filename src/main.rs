use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use env_logger::Env;
use log::{info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use netpool::config::{self, Config};
use netpool::ipam::LOCAL_ADDRESS_SPACE;

/// IP address management: reserve pools and addresses without overlap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file (default: in-memory store)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Reserve a pool, explicit or from the predefined catalog
    RequestPool {
        #[arg(long, default_value = LOCAL_ADDRESS_SPACE)]
        address_space: String,
        /// Pool CIDR; omit to pick from the catalog
        #[arg(long)]
        pool: Option<String>,
        /// Sub-pool CIDR inside the pool
        #[arg(long)]
        sub_pool: Option<String>,
        #[arg(long)]
        ipv6: bool,
        /// Driver option as key=value, repeatable
        #[arg(long = "opt", value_parser = parse_key_val)]
        options: Vec<(String, String)>,
    },
    /// Release a pool reference
    ReleasePool { pool_id: String },
    /// Reserve an address from a pool
    RequestAddress {
        pool_id: String,
        /// Preferred address
        #[arg(long)]
        address: Option<IpAddr>,
        #[arg(long = "opt", value_parser = parse_key_val)]
        options: Vec<(String, String)>,
    },
    /// Return an address to its pool
    ReleaseAddress { pool_id: String, address: IpAddr },
    /// Print the pool database and bitmaps
    Dump,
    /// Print the default address space names
    Defaults,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid key=value: no '=' found in '{}'", s))
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    let level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Some(path) = &args.config {
        info!("Configuration file: {:?}", path);
    }
    let allocator = config.build_allocator().wrap_err("Failed to initialize allocator")?;

    match args.command {
        Command::RequestPool { address_space, pool, sub_pool, ipv6, options } => {
            let options: HashMap<String, String> = options.into_iter().collect();
            let alloc = allocator.request_pool(
                &address_space,
                pool.as_deref().unwrap_or(""),
                sub_pool.as_deref().unwrap_or(""),
                &options,
                ipv6,
            )?;
            println!("{}\t{}", alloc.pool_id, alloc.pool);
        }
        Command::ReleasePool { pool_id } => {
            allocator.release_pool(&pool_id)?;
            info!("Released pool {}", pool_id);
        }
        Command::RequestAddress { pool_id, address, options } => {
            let options: HashMap<String, String> = options.into_iter().collect();
            let (addr, _) = allocator.request_address(&pool_id, address, &options)?;
            println!("{}", addr);
        }
        Command::ReleaseAddress { pool_id, address } => {
            allocator.release_address(&pool_id, address)?;
            info!("Released address {} from {}", address, pool_id);
        }
        Command::Dump => println!("{}", allocator.dump_database()),
        Command::Defaults => {
            let (local, global) = allocator.get_default_address_spaces();
            println!("{}\t{}", local, global);
        }
    }

    if args.config.is_none() {
        warn!("No --config given: allocations were kept in memory only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_request_pool() {
        let args = Args::parse_from([
            "netpool",
            "--config",
            "netpool.yaml",
            "request-pool",
            "--pool",
            "10.0.0.0/16",
            "--sub-pool",
            "10.0.1.0/24",
            "--opt",
            "dhcp_interface=eth0.10",
        ]);

        assert_eq!(args.config, Some(PathBuf::from("netpool.yaml")));
        assert_eq!(
            args.command,
            Command::RequestPool {
                address_space: "LocalDefault".to_string(),
                pool: Some("10.0.0.0/16".to_string()),
                sub_pool: Some("10.0.1.0/24".to_string()),
                ipv6: false,
                options: vec![("dhcp_interface".to_string(), "eth0.10".to_string())],
            }
        );
    }

    #[test]
    fn test_cli_release_address() {
        let args = Args::parse_from(["netpool", "release-address", "LocalDefault/10.0.0.0/16", "10.0.0.5"]);
        assert!(args.config.is_none());
        assert_eq!(
            args.command,
            Command::ReleaseAddress {
                pool_id: "LocalDefault/10.0.0.0/16".to_string(),
                address: "10.0.0.5".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_cli_rejects_bad_option() {
        assert!(Args::try_parse_from(["netpool", "request-pool", "--opt", "novalue"]).is_err());
        assert!(Args::try_parse_from(["netpool", "request-address", "id", "--address", "bogus"]).is_err());
    }
}

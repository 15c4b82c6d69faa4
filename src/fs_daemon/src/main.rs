mod fs_daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::fs_daemon::{run_colfs, ConfigOverrides, RunOptions, DEFAULT_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: colfs <mountpoint> [options]\n\
         options:\n\
         --config <path>        config file (default {})\n\
         --server <hosts>       contact points, comma separated\n\
         --keyspace <name>      keyspace to use\n\
         --owner <id>           owner id\n\
         --environment <name>   environment to mount\n\
         --consistency <level>  consistency level (one, quorum, all, ...)\n\
         --entry-ttl <secs>     kernel entry cache TTL\n\
         --negative-ttl <secs>  kernel negative cache TTL\n\
         --fcache-ttl <secs>    metadata cache TTL\n\
         --cache                enable the body cache\n\
         --cache-size <bytes>   body cache byte budget",
        DEFAULT_CONFIG_PATH
    )
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    let value = args
        .get(i)
        .ok_or_else(|| format!("missing value for {}", flag))?;
    value
        .parse::<T>()
        .map_err(|_| format!("bad value for {}: {}", flag, value))
}

fn parse_args() -> Result<RunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mountpoint = PathBuf::from(args[0].clone());
    let mut config_path = None;
    let mut overrides = ConfigOverrides::default();

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--server" => {
                i += 1;
                overrides.server = Some(parse_value(&args, i, "--server")?);
            }
            "--keyspace" => {
                i += 1;
                overrides.keyspace = Some(parse_value(&args, i, "--keyspace")?);
            }
            "--owner" => {
                i += 1;
                overrides.owner_id = Some(parse_value(&args, i, "--owner")?);
            }
            "--environment" => {
                i += 1;
                overrides.environment = Some(parse_value(&args, i, "--environment")?);
            }
            "--consistency" => {
                i += 1;
                overrides.consistency = Some(parse_value(&args, i, "--consistency")?);
            }
            "--entry-ttl" => {
                i += 1;
                overrides.entry_ttl_secs = Some(parse_value(&args, i, "--entry-ttl")?);
            }
            "--negative-ttl" => {
                i += 1;
                overrides.negative_ttl_secs = Some(parse_value(&args, i, "--negative-ttl")?);
            }
            "--fcache-ttl" => {
                i += 1;
                overrides.fcache_ttl_secs = Some(parse_value(&args, i, "--fcache-ttl")?);
            }
            "--cache" => {
                overrides.cache_enabled = Some(true);
            }
            "--cache-size" => {
                i += 1;
                overrides.cache_size_bytes = Some(parse_value(&args, i, "--cache-size")?);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(RunOptions {
        mountpoint,
        config_path,
        overrides,
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_colfs(options) {
        error!("run colfs failed: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod fs_daemon_tests;

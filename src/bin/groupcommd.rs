// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! groupcommd runs a single group communication endpoint and prints the
//! views and messages it delivers.

#![forbid(unsafe_code)]

use eyre::{eyre, Result, WrapErr};
use groupcomm::{config::keys, Config, Event};
use std::path::PathBuf;
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

const MODULE_NAME: &str = "groupcomm";

#[derive(Debug, StructOpt)]
#[structopt(name = "groupcommd", about = "Group communication daemon")]
struct Opt {
    /// Cluster name; must match across all peers.
    #[structopt(long)]
    group: String,

    /// Listen address, e.g. tcp://0.0.0.0:4567.
    #[structopt(long, default_value = "tcp://0.0.0.0:4567")]
    listen_addr: String,

    /// Comma separated list of peer addresses to join through.
    #[structopt(long, default_value = "")]
    peers: String,

    /// Found a new primary component instead of joining one.
    #[structopt(long)]
    bootstrap: bool,

    /// Directory for the persistent view state.
    #[structopt(long, default_value = ".")]
    state_dir: PathBuf,

    /// Extra configuration overrides as key=value pairs.
    #[structopt(long = "set", number_of_values = 1)]
    overrides: Vec<String>,

    /// Log to hourly rotated files in this directory instead of stdout.
    #[structopt(long)]
    log_dir: Option<PathBuf>,

    /// Verbosity; used when RUST_LOG is not set.
    #[structopt(short, parse(from_occurrences))]
    verbose: u8,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_node())
}

async fn run_node() -> Result<()> {
    let opt = Opt::from_args();

    let filter = match EnvFilter::try_from_env("RUST_LOG") {
        Ok(filter) => filter,
        Err(_) => {
            let level = match opt.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            };
            let module_filter = format!("{}={}", MODULE_NAME, level)
                .parse()
                .wrap_err("BUG: invalid module filter constructed")?;
            EnvFilter::from_default_env().add_directive(module_filter)
        }
    };

    let _optional_guard = if let Some(log_dir) = &opt.log_dir {
        let file_appender = tracing_appender::rolling::hourly(log_dir, "groupcommd.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_env_filter(filter)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    };

    let mut overrides = vec![
        (keys::GMCAST_GROUP.to_string(), opt.group.clone()),
        (keys::GMCAST_LISTEN_ADDR.to_string(), opt.listen_addr.clone()),
        (keys::GMCAST_PEER_ADDR.to_string(), opt.peers.clone()),
    ];
    for entry in &opt.overrides {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| eyre!("invalid override '{}', expected key=value", entry))?;
        overrides.push((key.to_string(), value.to_string()));
    }
    let config = Config::with_overrides(overrides).wrap_err("invalid configuration")?;

    let mut node = groupcomm::net::Node::start(config, &opt.state_dir)
        .await
        .wrap_err("failed to start node")?;
    node.connect(opt.bootstrap)
        .await
        .wrap_err("failed to join group")?;
    let status = node.status().await?;
    info!(
        "joined group '{}': {}",
        opt.group,
        serde_json::to_string(&status).unwrap_or_default()
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = node.recv() => {
                match event {
                    Some(Event::View(view)) => info!("view: {}", view),
                    Some(Event::Message { source, order, seq, payload, .. }) => {
                        info!(
                            "message from {} order {:?} seq {} ({} bytes)",
                            source,
                            order,
                            seq,
                            payload.len()
                        );
                    }
                    None => break,
                }
            }
            _ = &mut shutdown => {
                info!("shutting down");
                node.close(false).await.wrap_err("graceful close failed")?;
                break;
            }
        }
    }
    Ok(())
}

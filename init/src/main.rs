// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![doc = include_str!("../README.md")]
#![deny(clippy::pedantic, missing_docs)]

use clap::Parser;
use devices::kernel::NetlinkKernel;
use devices::{DatapathConfig, DeviceError, Manager, TunnelMode};
use std::path::PathBuf;
use std::sync::Arc;
use sysctl::{ProcSysctl, SysctlError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Errors which might occur during datapath device initialization
#[derive(Debug, thiserror::Error)]
enum InitErr {
    /// The configuration file could not be read.
    #[error("failed to read {path:?}: {source}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The configuration file is not a valid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml_ng::Error),
    /// `/proc/sys` is unusable.
    #[error(transparent)]
    Sysctl(#[from] SysctlError),
    /// The tokio runtime or the netlink socket could not be set up.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// A device step failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Parser)]
#[command(name = "datapath-init")]
#[command(about = "Bring up the datapath network devices", long_about = None)]
struct CmdArgs {
    #[arg(long, value_name = "YAML configuration file")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "none|geneve|vxlan")]
    tunnel_mode: Option<TunnelMode>,
}

impl CmdArgs {
    fn datapath_config(&self) -> Result<DatapathConfig, InitErr> {
        let mut config = match &self.config {
            Some(path) => {
                let yaml =
                    std::fs::read_to_string(path).map_err(|source| InitErr::ReadConfig {
                        path: path.clone(),
                        source,
                    })?;
                DatapathConfig::from_yaml(&yaml)?
            }
            None => DatapathConfig::default(),
        };
        if let Some(mode) = self.tunnel_mode {
            config.tunnel_mode = mode;
        }
        Ok(config)
    }
}

async fn run(config: DatapathConfig) -> Result<(), InitErr> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);
    let manager = Manager::new(
        NetlinkKernel::new(Arc::new(handle)),
        ProcSysctl::new()?,
        config.families,
    );

    let (host, _) = manager.setup_base(config.mtu).await?;
    manager
        .add_host_device_addr(&host, config.host_ipv4, config.host_ipv6)
        .await?;
    manager
        .reconcile(config.tunnel_mode, &config.tunnel_params())
        .await?;
    manager
        .setup_ipip(config.ipip4, config.ipip6, config.mtu)
        .await?;

    let name = devices::InterfaceName::try_from(host.name.as_str()).map_err(DeviceError::from)?;
    let state = manager.attachment_state(&name).await?;
    info!(device = %name, ?state, "datapath devices ready");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_file(true)
        .with_level(true)
        .with_line_number(true)
        .init();
}

fn main() {
    let args = CmdArgs::parse();
    init_logging();

    let result = args.datapath_config().and_then(|config| {
        info!(?config, "starting datapath device setup");
        tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?
            .block_on(run(config))
    });
    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}

use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;
use tubular_beans::broker::BrokerConfig;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 11300)]
    pub(crate) port: u16,
    /// Sets the maximum allowed job body size, in bytes.
    #[arg(short = 'z', long, default_value_t = 65535)]
    pub(crate) max_job_size: u32,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    pub(crate) fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_job_size: self.max_job_size,
        }
    }
}

//! Configuration options for the relay.

use std::path::PathBuf;

/// Runtime options, set by command line arguments.
#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "peer_relay")]
pub struct Config {
    /// The TCP port to accept peer connections on.
    #[clap(short = 'p', long, default_value = "9134")]
    pub port: u16,

    /// Path of the local control socket used to hand live connections over
    /// to a newly started instance. If not given, no handoff endpoint is
    /// created.
    #[clap(short = 'u', long)]
    pub control_socket: Option<PathBuf>,
}

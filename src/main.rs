#[macro_use]
extern crate log;

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::Lazy;
use peer_relay::{config, server::Server};
use rlimit::increase_nofile_limit;

// Load the config and treat it as a read-only static value.
static CONFIG: Lazy<config::Config> = Lazy::new(config::Config::parse);

extern "C" fn on_stop_listening(_: std::os::raw::c_int) {
    peer_relay::server::SHUTDOWN_LISTENERS.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    // Initialize logging.
    env_logger::Builder::from_env(
        Env::default()
            .default_filter_or("peer_relay=info")
            .default_write_style_or("never"),
    )
    .init();

    info!("peer_relay starting up...");
    info!(
        "peer_relay: v{}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );

    let config = &*CONFIG;
    info!("config:");
    info!("  {:20}{}", "port:", config.port);
    info!("  {:20}{:?}", "control_socket:", config.control_socket);

    // An fd per connection adds up; don't run at the default soft limit.
    let fd_limit = increase_nofile_limit(rlimit::INFINITY).context("raise RLIMIT_NOFILE")?;
    info!("FD limit: {}", fd_limit);

    let stop_listening = SigAction::new(
        SigHandler::Handler(on_stop_listening),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGUSR1, &stop_listening).context("sigaction(SIGUSR1)")?;
        sigaction(Signal::SIGPIPE, &ignore).context("sigaction(SIGPIPE)")?;
    }

    let mut server = Server::new(config)?;
    server.run()
}

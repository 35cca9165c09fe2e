//! Orchestrator (§2, §6): parses the CLI, opens the UART, builds the
//! initial image, and hands off to the reactor.

mod block;
mod bridge;
mod cli;
mod compal;
mod error;
mod hdlc;
mod image;
mod profile;
mod reactor;
mod romload;
mod serial;
mod session;

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use cli::Cli;
use error::DownloadError;
use image::Image;
use reactor::Reactor;
use serial::{Serial, Transport, BAUD_IDENT};
use session::Session;

fn run(cli: Cli) -> error::Result<()> {
    info!(
        "opening {} for profile {:?}",
        cli.device.display(),
        cli.profile
    );
    let mut serial = Serial::open(&cli.device)?;

    let image = Image::build(cli.profile, &cli.file)?;
    let session = Session::new(cli.profile, cli.file.clone(), image);

    if session.profile.is_compal() {
        info!("waiting for ramloader prompt1 on the serial line");
    } else {
        // §4.1/§4.5: the romloader's identification beacon and its reply
        // are exchanged at 19200 baud; the data-phase rate is negotiated
        // later, on param-ack (romload.rs). Matches the original's
        // `serial_set_baudrate(ROMLOAD_INIT_BAUDRATE)` ahead of
        // `start_beacon_timer()` in `main()`.
        serial.set_baud(BAUD_IDENT)?;
        info!("arming romload identification beacon");
    }

    let mut reactor = Reactor::new(serial, session, &cli.layer2_socket, &cli.loader_socket)?;
    reactor.run()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(DownloadError::PeerClosed) => {
            error!("phone closed the serial line");
            ExitCode::from(2)
        }
        Err(e @ DownloadError::PayloadTooLarge { .. }) => {
            error!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

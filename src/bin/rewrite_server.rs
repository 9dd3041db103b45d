//! Translation server binary.
//!
//! Speaks the protocol on stdin/stdout; diagnostics go to stderr.

use clap::Parser;
use rewrite_server::core::Session;
use rewrite_server::protocol::Conn;
use std::io::{self, BufReader, BufWriter};
use std::process::ExitCode;

/// All configuration is done by the client in the handshake.
#[derive(Parser, Debug)]
#[command(name = "rewrite-server", disable_version_flag = true)]
struct Cli {}

fn main() -> ExitCode {
    if Cli::try_parse().is_err() {
        eprintln!("usage: rewrite-server");
        eprintln!("all configuration is done by the client.");
        return ExitCode::from(1);
    }

    env_logger::init();

    let stdin = io::stdin();
    let stdout = io::stdout();
    let conn = Conn::new(BufReader::new(stdin.lock()), BufWriter::new(stdout.lock()));

    let result = Session::handshake(conn).and_then(|mut session| {
        session.run()?;
        log::debug!("served {} requests", session.translated());
        Ok(())
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(1)
        }
    }
}

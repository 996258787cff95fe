//! graphctl — thin CLI companion for graphd's control socket.
//!
//! Joins its arguments into a single command line, sends it over the
//! control socket, and prints whatever comes back. Exits 1 only when
//! the socket itself couldn't be reached; any response from the
//! daemon, including an error line, is a success from this binary's
//! point of view.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_SOCKET: &str = "/run/graph-resolver.sock";

fn socket_path() -> PathBuf {
    std::env::var("GRAPHD_CONTROL_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET))
}

fn main() -> ExitCode {
    let command = std::env::args().skip(1).collect::<Vec<_>>().join(" ");

    let mut stream = match UnixStream::connect(socket_path()) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("graphctl: cannot connect to graphd: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Only a failed connect is treated as failure from here on; once
    // we have a socket, write/read errors are reported but do not
    // flip the exit code, matching the original CLI's behavior.
    if let Err(err) = stream.write_all(command.as_bytes()) {
        eprintln!("graphctl: write failed: {err}");
    }
    if let Err(err) = stream.shutdown(std::net::Shutdown::Write) {
        eprintln!("graphctl: shutdown failed: {err}");
    }

    let mut response = String::new();
    if let Err(err) = stream.read_to_string(&mut response) {
        eprintln!("graphctl: read failed: {err}");
    }

    print!("{response}");
    ExitCode::SUCCESS
}

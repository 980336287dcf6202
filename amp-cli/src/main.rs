//! Thin client for the control plane in `amp-ctl`: create a client, or
//! send it a start/stop/status verb, and print whatever the daemon
//! replies with.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use amp_ctl::protocol::{Verb, SOCKET_DIR};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// directory the daemon's control sockets live under
    #[arg(long, default_value = SOCKET_DIR)]
    socket_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// load firmware onto a cpu and give the client a name
    Create {
        #[arg(long)]
        cpu: u32,
        name: String,
        firmware_path: String,
    },
    /// start a created client
    Start { name: String },
    /// stop a running client
    Stop { name: String },
    /// print a client's current state
    Status { name: String },
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let result = match args.command {
        Command::Create { cpu, name, firmware_path } => {
            amp_ctl::client::create(&args.socket_dir, cpu, &name, &firmware_path)
        }
        Command::Start { name } => amp_ctl::client::send_verb(&args.socket_dir, &name, Verb::Start),
        Command::Stop { name } => amp_ctl::client::send_verb(&args.socket_dir, &name, Verb::Stop),
        Command::Status { name } => amp_ctl::client::send_verb(&args.socket_dir, &name, Verb::Status),
    };

    match result {
        Ok(reply) => {
            println!("{reply}");
            if reply.starts_with("AMP-FAILED") {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("amp-cli: {e}");
            ExitCode::FAILURE
        }
    }
}

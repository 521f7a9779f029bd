mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "mvlc", version, about = "MVLC VME controller protocol tool")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        env = "MVLC_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);

    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_read() {
        let cli = Cli::try_parse_from([
            "mvlc",
            "read-register",
            "0x6008",
            "--socket",
            "/tmp/mvlc.sock",
        ])
        .expect("read-register args should parse");

        match cli.command {
            Command::ReadRegister(args) => assert_eq!(args.address, 0x6008),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_host_and_socket_together() {
        let err = Cli::try_parse_from([
            "mvlc",
            "vme-read",
            "0x1000",
            "--host",
            "mvlc-0001",
            "--socket",
            "/tmp/mvlc.sock",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn rejects_out_of_range_register() {
        let err = Cli::try_parse_from(["mvlc", "read-register", "0x10000", "--socket", "/tmp/s"])
            .expect_err("address should be rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_vme_width_and_amod() {
        let cli = Cli::try_parse_from([
            "mvlc", "vme-write", "0x1000", "7", "--amod", "0x0d", "--width", "d16", "--socket",
            "/tmp/s",
        ])
        .expect("vme-write args should parse");

        match cli.command {
            Command::VmeWrite(args) => {
                assert_eq!(args.amod, 0x0d);
                assert_eq!(args.value, 7);
                assert_eq!(args.width, cmd::WidthArg::D16);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

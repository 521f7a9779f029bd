use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use mvlc_cmd::{CmdPipe, CmdPipeConfig};
use mvlc_frame::codec::bytes_to_words;
use mvlc_frame::{StackCommandBuilder, VmeDataWidth};
use mvlc_readout::DEFAULT_FRAME_MAX_WORDS;
use mvlc_transport::{Connection, ConnectionType, UdpConfig, UdpTransport};

use crate::exit::{
    cmd_error, io_error, json_error, transport_error, CliError, CliResult, USAGE,
};
use crate::output::OutputFormat;

pub mod decode;
pub mod generate;
pub mod parse;
pub mod readout;
pub mod register;
pub mod version;
pub mod vme;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the frame headers of a little-endian word file.
    Decode(DecodeArgs),
    /// Write synthetic listfile-framed readout data.
    Generate(GenerateArgs),
    /// Run the readout parser over a word file.
    Parse(ParseArgs),
    /// Read a controller register.
    ReadRegister(ReadRegisterArgs),
    /// Write a controller register.
    WriteRegister(WriteRegisterArgs),
    /// Single-cycle VME read through the controller.
    VmeRead(VmeReadArgs),
    /// Single-cycle VME write through the controller.
    VmeWrite(VmeWriteArgs),
    /// Stream the data pipe into the readout parser.
    Readout(ReadoutArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Decode(args) => decode::run(args, format),
        Command::Generate(args) => generate::run(args, format),
        Command::Parse(args) => parse::run(args, format),
        Command::ReadRegister(args) => register::run_read(args, format),
        Command::WriteRegister(args) => register::run_write(args, format),
        Command::VmeRead(args) => vme::run_read(args, format),
        Command::VmeWrite(args) => vme::run_write(args, format),
        Command::Readout(args) => readout::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ConnectionArg {
    Usb,
    Eth,
}

impl From<ConnectionArg> for ConnectionType {
    fn from(arg: ConnectionArg) -> Self {
        match arg {
            ConnectionArg::Usb => ConnectionType::Usb,
            ConnectionArg::Eth => ConnectionType::Eth,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum WidthArg {
    D16,
    D32,
}

impl From<WidthArg> for VmeDataWidth {
    fn from(arg: WidthArg) -> Self {
        match arg {
            WidthArg::D16 => VmeDataWidth::D16,
            WidthArg::D32 => VmeDataWidth::D32,
        }
    }
}

/// How to reach the controller.
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Controller hostname or IP address (ETH).
    #[arg(long, env = "MVLC_HOST", conflicts_with = "socket")]
    pub host: Option<String>,
    /// Unix socket serving the command pipe with stream framing.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,
    /// Unix socket serving the data pipe.
    #[arg(long, value_name = "PATH", requires = "socket")]
    pub data_socket: Option<PathBuf>,
    /// Transaction timeout (e.g. 2s, 500ms).
    #[arg(long, default_value = "2s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Word file to decode.
    pub path: PathBuf,
    /// Framing of the file contents.
    #[arg(long, value_enum, default_value = "usb")]
    pub connection: ConnectionArg,
    /// Stop after N entries.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Output word file.
    pub output: PathBuf,
    /// Number of events to write.
    #[arg(long, default_value = "10")]
    pub events: usize,
    /// Modules per event.
    #[arg(long, default_value = "2")]
    pub modules: usize,
    /// Block read words per module and event.
    #[arg(long, default_value = "4")]
    pub dynamic_words: usize,
    /// Maximum words following a frame header.
    #[arg(long, env = "MVLC_FRAME_MAX_WORDS", default_value_t = DEFAULT_FRAME_MAX_WORDS)]
    pub frame_max_words: u32,
    /// Controller id written into the headers.
    #[arg(long, default_value = "0")]
    pub crate_index: u8,
    /// Insert a timetick system event every N events.
    #[arg(long)]
    pub timetick_every: Option<usize>,
    /// Also write the matching readout stacks as JSON.
    #[arg(long, value_name = "PATH")]
    pub stacks_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Word file holding readout data.
    pub path: PathBuf,
    /// Readout stacks (JSON, one entry per event).
    #[arg(long, value_name = "PATH")]
    pub stacks: PathBuf,
    /// Framing of the file contents.
    #[arg(long, value_enum, default_value = "usb")]
    pub connection: ConnectionArg,
    /// Split the input into buffers of at most this many words.
    #[arg(long, default_value = "16384")]
    pub buffer_words: usize,
    #[arg(long, default_value = "0")]
    pub crate_index: u8,
    /// Print every event, not only the summary.
    #[arg(long)]
    pub events: bool,
}

#[derive(Args, Debug)]
pub struct ReadRegisterArgs {
    /// Register address (hex with 0x prefix or decimal).
    #[arg(value_parser = parse_u16)]
    pub address: u16,
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct WriteRegisterArgs {
    #[arg(value_parser = parse_u16)]
    pub address: u16,
    #[arg(value_parser = parse_u32)]
    pub value: u32,
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct VmeReadArgs {
    /// VME address.
    #[arg(value_parser = parse_u32)]
    pub address: u32,
    /// Address modifier.
    #[arg(long, value_parser = parse_u8, default_value = "0x09")]
    pub amod: u8,
    #[arg(long, value_enum, default_value = "d32")]
    pub width: WidthArg,
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct VmeWriteArgs {
    #[arg(value_parser = parse_u32)]
    pub address: u32,
    #[arg(value_parser = parse_u32)]
    pub value: u32,
    #[arg(long, value_parser = parse_u8, default_value = "0x09")]
    pub amod: u8,
    #[arg(long, value_enum, default_value = "d32")]
    pub width: WidthArg,
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct ReadoutArgs {
    /// Readout stacks (JSON, one entry per event).
    #[arg(long, value_name = "PATH")]
    pub stacks: PathBuf,
    /// Stop after N buffers.
    #[arg(long)]
    pub max_buffers: Option<u64>,
    #[arg(long, default_value = "0")]
    pub crate_index: u8,
    /// Print every event, not only the summary.
    #[arg(long)]
    pub events: bool,
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_number(input: &str) -> Result<u64, String> {
    let input = input.trim();
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => input.replace('_', "").parse(),
    };
    parsed.map_err(|_| format!("invalid number: {input}"))
}

pub fn parse_u32(input: &str) -> Result<u32, String> {
    u32::try_from(parse_number(input)?).map_err(|_| format!("value out of range: {input}"))
}

pub fn parse_u16(input: &str) -> Result<u16, String> {
    u16::try_from(parse_number(input)?).map_err(|_| format!("value out of range: {input}"))
}

pub fn parse_u8(input: &str) -> Result<u8, String> {
    u8::try_from(parse_number(input)?).map_err(|_| format!("value out of range: {input}"))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Little-endian 32-bit words. Trailing bytes are ignored.
pub fn read_words(path: &Path) -> CliResult<Vec<u32>> {
    let bytes = std::fs::read(path)
        .map_err(|err| io_error(&format!("read {}", path.display()), err))?;

    if bytes.len() % 4 != 0 {
        tracing::warn!(
            path = %path.display(),
            trailing = bytes.len() % 4,
            "ignoring trailing bytes"
        );
    }
    Ok(bytes_to_words(&bytes))
}

pub fn load_stacks(path: &Path) -> CliResult<Vec<StackCommandBuilder>> {
    let file = std::fs::File::open(path)
        .map_err(|err| io_error(&format!("open {}", path.display()), err))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|err| json_error(&format!("parse {}", path.display()), err))
}

pub fn connect(args: &ConnectArgs) -> CliResult<Connection> {
    if let Some(host) = &args.host {
        let transport = UdpTransport::connect(host, &UdpConfig::default())
            .map_err(|err| transport_error("connect failed", err))?;
        return Ok(transport.into());
    }

    match &args.socket {
        #[cfg(unix)]
        Some(path) => {
            let transport = mvlc_transport::StreamTransport::connect_unix(
                path,
                args.data_socket.as_deref(),
                &mvlc_transport::StreamConfig::default(),
            )
            .map_err(|err| transport_error("connect failed", err))?;
            Ok(transport.into())
        }
        #[cfg(not(unix))]
        Some(_) => Err(CliError::new(USAGE, "--socket requires a unix platform")),
        None => Err(CliError::new(USAGE, "one of --host or --socket is required")),
    }
}

pub fn open_cmd_pipe(args: &ConnectArgs) -> CliResult<CmdPipe<Connection>> {
    let timeout = parse_duration(&args.timeout)?;
    let config = CmdPipeConfig {
        super_timeout: timeout,
        stack_timeout: timeout,
        ..CmdPipeConfig::default()
    };

    CmdPipe::new(connect(args)?, config).map_err(|err| cmd_error("command pipe failed", err))
}

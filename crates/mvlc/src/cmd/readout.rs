use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mvlc_frame::codec::bytes_to_words;
use mvlc_frame::FrameReader;
use mvlc_readout::{
    callbacks_from_fn, parse_readout_buffer, ModuleData, ReadoutParserCounters, ReadoutParserState,
};
use mvlc_transport::{Connection, ConnectionType, Pipe, Transport, TransportError};

use crate::cmd::parse::{print_event, ParseSummary};
use crate::cmd::{connect, load_stacks, ReadoutArgs};
use crate::exit::{readout_error, transport_error, CliError, CliResult, SUCCESS};
use crate::output::OutputFormat;

const PACKET_BUFFER_BYTES: usize = 64 * 1024;

pub fn run(args: ReadoutArgs, format: OutputFormat) -> CliResult<i32> {
    let stacks = load_stacks(&args.stacks)?;
    let mut state = ReadoutParserState::from_stacks(&stacks, args.crate_index)
        .map_err(|err| readout_error("invalid readout stacks", err))?;
    let mut counters = ReadoutParserCounters::new();

    let transport = connect(&args.connect)?;
    let connection = transport.connection_type();

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let print_events = args.events;
    let mut callbacks = callbacks_from_fn(
        |_crate_index: u8, event_index: usize, modules: &[ModuleData<'_>]| {
            if print_events {
                print_event(event_index, modules, format);
            }
        },
        |_crate_index: u8, _header_and_data: &[u32]| {},
    );

    tracing::info!(connection = ?connection, "readout started");

    let mut source = BufferSource::new(connection);
    let mut buffer_number = 0u32;

    while running.load(Ordering::SeqCst) {
        if let Some(max) = args.max_buffers {
            if u64::from(buffer_number) >= max {
                break;
            }
        }

        let buffer = match source.next_buffer(&transport) {
            Ok(Some(buffer)) => buffer,
            Ok(None) => continue,
            Err(err) if err.is_timeout() => continue,
            Err(err) if err.is_disconnect() => {
                tracing::warn!(error = %err, "data pipe disconnected");
                break;
            }
            Err(err) => return Err(transport_error("data pipe read failed", err)),
        };

        buffer_number = buffer_number.wrapping_add(1);
        let result = parse_readout_buffer(
            connection,
            &mut state,
            &mut callbacks,
            &mut counters,
            buffer_number,
            &buffer,
        );
        if !result.is_success() {
            tracing::warn!(buffer = buffer_number, result = result.name(), "buffer parse failed");
        }
    }

    tracing::info!(buffers = buffer_number, events = counters.total_events(), "readout stopped");
    ParseSummary::from_counters(&counters).print(format);
    Ok(SUCCESS)
}

/// Produces parser input from the data pipe.
///
/// Stream connections yield every complete frame chain buffered so far.
/// ETH connections yield one packet including its header words.
struct BufferSource {
    connection: ConnectionType,
    frames: FrameReader,
    packet: Vec<u8>,
}

impl BufferSource {
    fn new(connection: ConnectionType) -> Self {
        Self {
            connection,
            frames: FrameReader::new(),
            packet: vec![0; PACKET_BUFFER_BYTES],
        }
    }

    fn next_buffer(&mut self, transport: &Connection) -> Result<Option<Vec<u32>>, TransportError> {
        match self.connection {
            ConnectionType::Usb => {
                let fill = self
                    .frames
                    .fill_from(transport, Pipe::Data)
                    .map_err(frame_to_transport)?;
                if fill.bytes == 0 {
                    return Err(TransportError::Disconnected("data pipe closed".into()));
                }

                let mut words = Vec::new();
                while let Some(frame) = self.frames.take_frame() {
                    words.extend(frame.words());
                }
                Ok((!words.is_empty()).then_some(words))
            }
            ConnectionType::Eth => {
                let res = transport.read_packet(Pipe::Data, &mut self.packet)?;
                let end = res.bytes_transferred.min(self.packet.len());
                Ok(Some(bytes_to_words(&self.packet[..end])))
            }
        }
    }
}

fn frame_to_transport(err: mvlc_frame::FrameError) -> TransportError {
    match err {
        mvlc_frame::FrameError::Transport(err) => err,
        mvlc_frame::FrameError::Io(err) => TransportError::from_io(err),
        other => TransportError::Disconnected(other.to_string()),
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

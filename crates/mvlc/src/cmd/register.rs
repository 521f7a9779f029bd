use crate::cmd::{open_cmd_pipe, ReadRegisterArgs, WriteRegisterArgs};
use crate::exit::{cmd_error, CliResult, SUCCESS};
use crate::output::{hex16, hex32, print_fields, OutputFormat};

pub fn run_read(args: ReadRegisterArgs, format: OutputFormat) -> CliResult<i32> {
    let mvlc = open_cmd_pipe(&args.connect)?;
    let value = mvlc
        .read_register(args.address)
        .map_err(|err| cmd_error("read register failed", err))?;

    print_fields(
        &[("address", hex16(args.address)), ("value", hex32(value))],
        format,
    );
    Ok(SUCCESS)
}

pub fn run_write(args: WriteRegisterArgs, format: OutputFormat) -> CliResult<i32> {
    let mvlc = open_cmd_pipe(&args.connect)?;
    mvlc.write_register(args.address, args.value)
        .map_err(|err| cmd_error("write register failed", err))?;

    print_fields(
        &[
            ("address", hex16(args.address)),
            ("value", hex32(args.value)),
            ("status", "ok".to_string()),
        ],
        format,
    );
    Ok(SUCCESS)
}

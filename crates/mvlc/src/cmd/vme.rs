use mvlc_frame::VmeDataWidth;

use crate::cmd::{open_cmd_pipe, VmeReadArgs, VmeWriteArgs};
use crate::exit::{cmd_error, CliResult, SUCCESS};
use crate::output::{hex32, print_fields, OutputFormat};

fn width_name(width: VmeDataWidth) -> &'static str {
    match width {
        VmeDataWidth::D16 => "d16",
        VmeDataWidth::D32 => "d32",
    }
}

pub fn run_read(args: VmeReadArgs, format: OutputFormat) -> CliResult<i32> {
    let width = VmeDataWidth::from(args.width);
    let mvlc = open_cmd_pipe(&args.connect)?;
    let value = mvlc
        .vme_read(args.address, args.amod, width)
        .map_err(|err| cmd_error("vme read failed", err))?;

    print_fields(
        &[
            ("address", hex32(args.address)),
            ("amod", format!("{:#04x}", args.amod)),
            ("width", width_name(width).to_string()),
            ("value", hex32(value)),
        ],
        format,
    );
    Ok(SUCCESS)
}

pub fn run_write(args: VmeWriteArgs, format: OutputFormat) -> CliResult<i32> {
    let width = VmeDataWidth::from(args.width);
    let mvlc = open_cmd_pipe(&args.connect)?;
    mvlc.vme_write(args.address, args.value, args.amod, width)
        .map_err(|err| cmd_error("vme write failed", err))?;

    print_fields(
        &[
            ("address", hex32(args.address)),
            ("amod", format!("{:#04x}", args.amod)),
            ("width", width_name(width).to_string()),
            ("value", hex32(args.value)),
            ("status", "ok".to_string()),
        ],
        format,
    );
    Ok(SUCCESS)
}

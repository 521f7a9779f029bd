use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_table<R, C>(header: &[&str], rows: R)
where
    R: IntoIterator<Item = Vec<C>>,
    C: Into<comfy_table::Cell>,
{
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
}

/// Key/value pairs in the requested format. `Raw` prints values only.
pub fn print_fields(fields: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let map: serde_json::Map<String, serde_json::Value> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect();
            print_json(&map);
        }
        OutputFormat::Table => print_table(
            &["FIELD", "VALUE"],
            fields.iter().map(|(k, v)| vec![k.to_string(), v.clone()]),
        ),
        OutputFormat::Pretty => {
            let line: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
            println!("{}", line.join(" "));
        }
        OutputFormat::Raw => {
            for (_, v) in fields {
                println!("{v}");
            }
        }
    }
}

pub fn hex32(value: u32) -> String {
    format!("{value:#010x}")
}

pub fn hex16(value: u16) -> String {
    format!("{value:#06x}")
}

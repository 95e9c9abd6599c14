use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use formula_dataio::{list_sheet_names, ExcelParser, ParseOptions};

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(about = "Inspect the sheets, headers and data rows of an XLSX workbook.")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sheet names in workbook order.
    Sheets {
        workbook: PathBuf,

        /// Include hidden and very hidden sheets.
        #[arg(long)]
        include_hidden: bool,
    },
    /// Print the header row of a sheet, one column per line.
    Headers {
        workbook: PathBuf,

        #[arg(long)]
        sheet: String,

        #[arg(long, default_value_t = 1)]
        header_row: u32,

        /// Keep header text as written instead of stripping characters outside `[A-Za-z0-9_]`.
        #[arg(long)]
        raw: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Exit with status 0 when the sheet has at least one non-blank data row, 1 otherwise.
    HasRows {
        workbook: PathBuf,

        #[arg(long)]
        sheet: String,

        #[arg(long, default_value_t = 2)]
        data_row: u32,
    },
    /// Print the data rows of a sheet.
    Dump {
        workbook: PathBuf,

        #[arg(long)]
        sheet: String,

        /// Header row; `0` keys fields by column letter.
        #[arg(long, default_value_t = 1)]
        header_row: u32,

        #[arg(long, default_value_t = 2)]
        data_row: u32,

        /// Last data row to read (inclusive).
        #[arg(long)]
        end_row: Option<u32>,

        #[arg(long)]
        start_column: Option<String>,

        #[arg(long)]
        end_column: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Serialize)]
struct JsonHeader<'a> {
    column: &'a str,
    header: &'a str,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Sheets {
            workbook,
            include_hidden,
        } => {
            let names = list_sheet_names(&workbook, include_hidden)
                .with_context(|| format!("list sheets of {}", workbook.display()))?;
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Command::Headers {
            workbook,
            sheet,
            header_row,
            raw,
            format,
        } => {
            let options = ParseOptions::new(&sheet).with_rows(header_row, header_row + 1);
            let parser = open(&workbook, options)?;
            let headers = parser
                .headers(!raw)
                .with_context(|| format!("read headers of '{sheet}'"))?;
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            for (column, header) in headers.to_pairs() {
                match format {
                    OutputFormat::Text => writeln!(handle, "{column}\t{header}")?,
                    OutputFormat::Json => {
                        serde_json::to_writer(
                            &mut handle,
                            &JsonHeader {
                                column: &column,
                                header: &header,
                            },
                        )?;
                        handle.write_all(b"\n")?;
                    }
                }
            }
            Ok(())
        }
        Command::HasRows {
            workbook,
            sheet,
            data_row,
        } => {
            let options = ParseOptions::new(&sheet).with_rows(0, data_row);
            let parser = open(&workbook, options)?;
            let has_rows = parser
                .has_data_rows()
                .with_context(|| format!("scan rows of '{sheet}'"))?;
            println!("{has_rows}");
            if !has_rows {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Dump {
            workbook,
            sheet,
            header_row,
            data_row,
            end_row,
            start_column,
            end_column,
            format,
        } => {
            let mut options = ParseOptions::new(&sheet)
                .with_rows(header_row, data_row)
                .with_columns(start_column.as_deref(), end_column.as_deref());
            if let Some(end) = end_row {
                options = options.with_data_row_end(end);
            }
            let parser = open(&workbook, options)?;

            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            for row in parser.rows() {
                let row = row.with_context(|| format!("read rows of '{sheet}'"))?;
                match format {
                    OutputFormat::Text => {
                        let fields: Vec<String> = row
                            .fields()
                            .iter()
                            .map(|(name, value)| format!("{name}={value}"))
                            .collect();
                        writeln!(handle, "{}\t{}", row.row_id(), fields.join("\t"))?;
                    }
                    OutputFormat::Json => {
                        serde_json::to_writer(&mut handle, &row)?;
                        handle.write_all(b"\n")?;
                    }
                }
            }
            Ok(())
        }
    }
}

fn open(workbook: &Path, options: ParseOptions) -> Result<ExcelParser> {
    ExcelParser::open(workbook, options).with_context(|| format!("open {}", workbook.display()))
}

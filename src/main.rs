// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// CLI entrypoint for psiforge.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};

use psiforge::asm::assembler::AsmOptions;
use psiforge::asm::output::OutputForm;
use psiforge::cc::linkcheck::UnitSource;
use psiforge::core::diag::DiagnosticBundle;
use psiforge::driver;
use psiforge::emu::display::RenderOptions;
use psiforge::emu::emulator::{Emulator, StopReason, DEFAULT_LOAD_ADDR};
use psiforge::models::{self, Model};
use psiforge::opk::records::{derive_name, PackType};

const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(
    name = "psiforge",
    version,
    about = "Psion Organiser II toolchain: Small-C compiler, HD6303 assembler, OPK packer, emulator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    #[arg(
        long = "format",
        value_enum,
        default_value_t = OutputFormat::Text,
        global = true,
        long_help = "Select output format for machine-readable commands. text is default; json emits structured output where supported."
    )]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PackKind {
    Datapak,
    Rampak,
    Flashpak,
}

impl PackKind {
    fn to_type(self) -> PackType {
        match self {
            PackKind::Datapak => PackType::Datapak,
            PackKind::Rampak => PackType::Rampak,
            PackKind::Flashpak => PackType::Flashpak,
        }
    }
}

#[derive(Args)]
struct ModelArg {
    #[arg(
        long = "model",
        default_value = "XP",
        long_help = "Target model: CM, XP16, XP, LZ or LZ64. Selects display geometry, RAM size and the predefined preprocessor symbols."
    )]
    model: String,
}

impl ModelArg {
    fn resolve(&self) -> Result<Model, String> {
        models::lookup(&self.model).ok_or_else(|| format!("unknown model: {}", self.model))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Compile C sources (and .asm companions) to assembly text.
    Cc {
        /// Input files; .c compiles, .asm passes through to the link order.
        inputs: Vec<PathBuf>,
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,
        #[arg(short = 'I', long = "include", value_name = "DIR")]
        include: Vec<PathBuf>,
        #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
        define: Vec<String>,
        #[command(flatten)]
        model: ModelArg,
    },
    /// Assemble HD6303 source into an object, raw binary or procedure.
    Asm {
        input: PathBuf,
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,
        #[arg(
            long = "raw",
            conflicts_with = "proc_form",
            long_help = "Emit bytes only: no header, no relocation support."
        )]
        raw: bool,
        #[arg(
            long = "proc",
            long_help = "Emit the bare procedure wrapper without the object header."
        )]
        proc_form: bool,
        #[arg(
            short = 'r',
            long = "relocatable",
            long_help = "Emit self-relocating output: position-independent stub, code linked at zero, fixup table."
        )]
        relocatable: bool,
        #[arg(long = "no-optimize", long_help = "Disable the peephole optimizer.")]
        no_optimize: bool,
        #[arg(short = 'l', long = "listing", value_name = "FILE")]
        listing: Option<PathBuf>,
        #[arg(short = 'g', long = "debug", value_name = "FILE")]
        debug: Option<PathBuf>,
        #[arg(short = 'I', long = "include", value_name = "DIR")]
        include: Vec<PathBuf>,
        #[command(flatten)]
        model: ModelArg,
    },
    /// Pack container operations.
    #[command(subcommand)]
    Opk(OpkCommand),
    /// Build C sources straight into a pack image.
    Build {
        inputs: Vec<PathBuf>,
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: PathBuf,
        #[arg(long = "name", long_help = "Record name; derived from the output file stem when omitted.")]
        name: Option<String>,
        #[arg(long = "size", default_value_t = 16)]
        size: u32,
        #[arg(short = 'r', long = "relocatable")]
        relocatable: bool,
        #[arg(short = 'I', long = "include", value_name = "DIR")]
        include: Vec<PathBuf>,
        #[command(flatten)]
        model: ModelArg,
    },
    /// Run a pack or raw image in the emulator.
    Run {
        input: PathBuf,
        #[arg(long = "cycles", default_value_t = 2_000_000)]
        cycles: u64,
        #[arg(
            long = "tap",
            value_name = "KEY",
            long_help = "Tap a key before running; repeatable, taps queue in order."
        )]
        tap: Vec<String>,
        #[command(flatten)]
        model: ModelArg,
    },
}

#[derive(Subcommand)]
enum OpkCommand {
    /// Create a pack from OB3 objects or raw payloads.
    Create {
        inputs: Vec<PathBuf>,
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: PathBuf,
        #[arg(long = "size", default_value_t = 16)]
        size: u32,
        #[arg(long = "type", value_enum, default_value_t = PackKind::Datapak)]
        pack_type: PackKind,
    },
    /// List the record directory of a pack.
    Inspect { input: PathBuf },
    /// Extract one record's payload.
    Extract {
        input: PathBuf,
        record: String,
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(failure) => {
            eprintln!("{}", failure.message);
            ExitCode::from(failure.code)
        }
    }
}

struct Failure {
    code: u8,
    message: String,
}

impl Failure {
    fn usage(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_USAGE,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_ERROR,
            message: message.into(),
        }
    }
}

impl From<DiagnosticBundle> for Failure {
    fn from(bundle: DiagnosticBundle) -> Self {
        Failure::error(bundle.to_string())
    }
}

fn read_file(path: &PathBuf) -> Result<String, Failure> {
    std::fs::read_to_string(path)
        .map_err(|err| Failure::usage(format!("cannot read {}: {err}", path.display())))
}

fn read_bytes(path: &PathBuf) -> Result<Vec<u8>, Failure> {
    std::fs::read(path)
        .map_err(|err| Failure::usage(format!("cannot read {}: {err}", path.display())))
}

fn write_bytes(path: &PathBuf, bytes: &[u8]) -> Result<(), Failure> {
    std::fs::write(path, bytes)
        .map_err(|err| Failure::error(format!("cannot write {}: {err}", path.display())))
}

fn parse_defines(defines: &[String]) -> Vec<(String, String)> {
    defines
        .iter()
        .map(|d| match d.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (d.clone(), "1".to_string()),
        })
        .collect()
}

fn load_units(inputs: &[PathBuf]) -> Result<Vec<UnitSource>, Failure> {
    if inputs.is_empty() {
        return Err(Failure::usage("no input files"));
    }
    let mut units = Vec::new();
    for path in inputs {
        let text = read_file(path)?;
        let file = path.display().to_string();
        match path.extension().and_then(|e| e.to_str()) {
            Some("c") | Some("C") => units.push(UnitSource::C { file, text }),
            Some("asm") | Some("s") | Some("inc") => units.push(UnitSource::Asm { file, text }),
            _ => {
                return Err(Failure::usage(format!(
                    "{}: unknown input kind (expected .c or .asm)",
                    path.display()
                )));
            }
        }
    }
    Ok(units)
}

fn run(cli: Cli) -> Result<(), Failure> {
    match cli.command {
        Command::Cc {
            inputs,
            output,
            include,
            define,
            model,
        } => {
            let model = model.resolve().map_err(Failure::usage)?;
            let units = load_units(&inputs)?;
            let defines = parse_defines(&define);
            let asm_text = driver::compile_c(&units, model, &include, &defines)?;
            match output {
                Some(path) => write_bytes(&path, asm_text.as_bytes())?,
                None => print!("{asm_text}"),
            }
            Ok(())
        }

        Command::Asm {
            input,
            output,
            raw,
            proc_form,
            relocatable,
            no_optimize,
            listing,
            debug,
            include,
            model,
        } => {
            let model = model.resolve().map_err(Failure::usage)?;
            let source = read_file(&input)?;
            let form = if raw {
                OutputForm::Raw
            } else if proc_form {
                OutputForm::Proc
            } else {
                OutputForm::Object
            };
            let options = AsmOptions {
                model,
                relocatable,
                optimize: !no_optimize,
                want_listing: listing.is_some(),
                want_debug: debug.is_some(),
                include_paths: include,
                defines: Vec::new(),
            };
            let result = driver::assemble(&source, &input.display().to_string(), &options, form)?;
            let out_path = output.unwrap_or_else(|| {
                input.with_extension(match form {
                    OutputForm::Raw => "bin",
                    OutputForm::Proc => "prc",
                    OutputForm::Object => "ob3",
                })
            });
            write_bytes(&out_path, &result.object)?;
            if let (Some(path), Some(text)) = (listing, result.listing.as_ref()) {
                write_bytes(&path, text.as_bytes())?;
            }
            if let (Some(path), Some(text)) = (debug, result.debug.as_ref()) {
                write_bytes(&path, text.as_bytes())?;
            }
            Ok(())
        }

        Command::Opk(opk) => run_opk(opk, cli.format),

        Command::Build {
            inputs,
            output,
            name,
            size,
            relocatable,
            include,
            model,
        } => {
            let model = model.resolve().map_err(Failure::usage)?;
            let units = load_units(&inputs)?;
            let record_name = match name {
                Some(name) => name,
                None => {
                    let stem = output
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default();
                    derive_name(stem).ok_or_else(|| {
                        Failure::usage(format!(
                            "cannot derive a record name from {}; pass --name",
                            output.display()
                        ))
                    })?
                }
            };
            let pack =
                driver::build_pack(&units, &record_name, model, relocatable, size, &include)?;
            write_bytes(&output, &pack)?;
            Ok(())
        }

        Command::Run {
            input,
            cycles,
            tap,
            model,
        } => {
            let model = model.resolve().map_err(Failure::usage)?;
            let bytes = read_bytes(&input)?;
            let mut emu = Emulator::new(model);

            let code = if bytes.starts_with(b"OPK") {
                emu.load_pack(&bytes, 0).map_err(|d| Failure::error(d.format()))?;
                driver::pack_first_procedure(&bytes).map_err(|d| Failure::error(d.format()))?
            } else {
                bytes
            };
            emu.inject_program(&code, DEFAULT_LOAD_ADDR);
            for key in &tap {
                emu.tap_key(key, 20_000);
            }
            let result = emu.run(cycles);
            for row in emu.display_text() {
                println!("|{row}|");
            }
            match result.reason {
                StopReason::ProgramExit | StopReason::CyclesExhausted | StopReason::Idle => {
                    eprintln!("ran {} cycles", result.cycles);
                    let _ = emu.render_display(RenderOptions::default());
                    Ok(())
                }
                StopReason::Breakpoint(addr) => {
                    Err(Failure::error(format!("stopped at breakpoint ${addr:04X}")))
                }
                StopReason::Fault(fault) => Err(Failure::error(format!("CPU fault: {fault:?}"))),
            }
        }
    }
}

fn run_opk(opk: OpkCommand, format: OutputFormat) -> Result<(), Failure> {
    match opk {
        OpkCommand::Create {
            inputs,
            output,
            size,
            pack_type,
        } => {
            if inputs.is_empty() {
                return Err(Failure::usage("no input files"));
            }
            let mut records = Vec::new();
            for path in &inputs {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default();
                let name = derive_name(stem).ok_or_else(|| {
                    Failure::usage(format!(
                        "cannot derive a record name from {}",
                        path.display()
                    ))
                })?;
                records.push((name, read_bytes(path)?));
            }
            let pack = driver::pack_create(&records, size, pack_type.to_type())
                .map_err(|d| Failure::error(d.format()))?;
            write_bytes(&output, &pack)?;
            Ok(())
        }
        OpkCommand::Inspect { input } => {
            let bytes = read_bytes(&input)?;
            let directory =
                driver::pack_inspect(&bytes).map_err(|d| Failure::error(d.format()))?;
            match format {
                OutputFormat::Json => {
                    let text = serde_json::to_string_pretty(&directory)
                        .map_err(|err| Failure::error(err.to_string()))?;
                    println!("{text}");
                }
                OutputFormat::Text => {
                    println!("NAME      TYPE  LENGTH");
                    for entry in directory {
                        println!(
                            "{:<8}  ${:02X}   {}",
                            entry.name, entry.record_type, entry.length
                        );
                    }
                }
            }
            Ok(())
        }
        OpkCommand::Extract {
            input,
            record,
            output,
        } => {
            let bytes = read_bytes(&input)?;
            let payload = driver::pack_extract(&bytes, &record)
                .map_err(|d| Failure::error(d.format()))?;
            write_bytes(&output, &payload)?;
            Ok(())
        }
    }
}

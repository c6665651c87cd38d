//! CLI entry point: loads a raw guest image into a fresh engine, runs it and
//! prints the final register state.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use cinder_core::{
    Arch, Engine, EngineState, Mode, Permissions, RegId, RiscvReg, StartOptions, X86Reg,
};
use clap::{Parser, ValueEnum};
#[cfg(test)]
use tempfile as _;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Guest flavours the runner can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    /// 32-bit flat x86.
    X86,
    /// RISC-V RV32IM.
    Rv32,
    /// RISC-V RV64IM.
    Rv64,
}

impl Target {
    const fn arch_mode(self) -> (Arch, Mode) {
        match self {
            Self::X86 => (Arch::X86, Mode::MODE_32),
            Self::Rv32 => (Arch::Riscv, Mode::RISCV32),
            Self::Rv64 => (Arch::Riscv, Mode::RISCV64),
        }
    }

    fn registers(self) -> Vec<(String, RegId)> {
        match self {
            Self::X86 => [
                X86Reg::Eax,
                X86Reg::Ecx,
                X86Reg::Edx,
                X86Reg::Ebx,
                X86Reg::Esp,
                X86Reg::Ebp,
                X86Reg::Esi,
                X86Reg::Edi,
                X86Reg::Eip,
                X86Reg::Eflags,
            ]
            .into_iter()
            .map(|reg| (format!("{reg:?}").to_lowercase(), reg.into()))
            .collect(),
            Self::Rv32 | Self::Rv64 => (0..32)
                .filter_map(|index| {
                    RiscvReg::x(index).map(|reg| (format!("x{index}"), reg.into()))
                })
                .chain(std::iter::once(("pc".to_string(), RiscvReg::Pc.into())))
                .collect(),
        }
    }

    const fn width(self) -> usize {
        match self {
            Self::X86 | Self::Rv32 => 8,
            Self::Rv64 => 16,
        }
    }
}

/// Run a raw guest image on the cinder emulation engine.
#[derive(Debug, Parser)]
#[command(name = "cinder-run", version, about)]
struct Args {
    /// Raw image to load.
    image: PathBuf,

    /// Guest architecture and mode.
    #[arg(short, long, value_enum, default_value_t = Target::Rv32)]
    target: Target,

    /// Load and entry address.
    #[arg(short, long, value_parser = parse_u64, default_value = "0x1000")]
    base: u64,

    /// Stop address; defaults to the first byte after the image.
    #[arg(short, long, value_parser = parse_u64)]
    until: Option<u64>,

    /// Maximum number of instructions (0 = unbounded).
    #[arg(short, long, default_value_t = 0)]
    count: u64,

    /// Wall-clock budget in microseconds (0 = unbounded).
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Extra read/write region as `ADDR:SIZE`; may be repeated.
    #[arg(long = "map", value_parser = parse_region)]
    regions: Vec<(u64, u64)>,

    /// Initial stack pointer.
    #[arg(long, value_parser = parse_u64)]
    stack: Option<u64>,

    /// Treat any guest interrupt as a request to stop.
    #[arg(long)]
    stop_on_interrupt: bool,

    /// Print every executed instruction address.
    #[arg(long)]
    trace: bool,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(short, long)]
    verbose: bool,
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let text = text.replace('_', "");
    let parsed = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .map_or_else(|| text.parse(), |hex| u64::from_str_radix(hex, 16));
    parsed.map_err(|error| format!("invalid number `{text}`: {error}"))
}

fn parse_region(text: &str) -> Result<(u64, u64), String> {
    let (addr, size) = text
        .split_once(':')
        .ok_or_else(|| format!("expected ADDR:SIZE, got `{text}`"))?;
    Ok((parse_u64(addr)?, parse_u64(size)?))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Page-aligned `(start, size)` covering `len` bytes at `addr`.
fn page_span(addr: u64, len: u64, page: u64) -> Result<(u64, u64)> {
    let start = addr - addr % page;
    let end = addr
        .checked_add(len.max(1))
        .and_then(|end| end.checked_next_multiple_of(page))
        .context("image does not fit in the address space")?;
    Ok((start, end - start))
}

/// Opens the engine, maps and writes the image and installs the CLI hooks.
/// Returns the engine and the image length.
fn load(args: &Args) -> Result<(Engine, u64)> {
    let image = fs::read(&args.image)
        .with_context(|| format!("failed to read image {}", args.image.display()))?;
    if image.is_empty() {
        bail!("image {} is empty", args.image.display());
    }

    let (arch, mode) = args.target.arch_mode();
    let mut engine = Engine::open(arch, mode).context("failed to open engine")?;
    let page = engine.config().page_size;

    let (start, size) = page_span(args.base, image.len() as u64, page)?;
    engine
        .mem_map(start, size)
        .with_context(|| format!("failed to map image at {start:#x}"))?;
    engine
        .mem_write(args.base, &image)
        .context("failed to write image")?;
    debug!(start, size, bytes = image.len(), "image loaded");

    for &(addr, len) in &args.regions {
        let (start, size) = page_span(addr, len, page)?;
        engine
            .mem_map_prot(start, size, Permissions::READ | Permissions::WRITE)
            .with_context(|| format!("failed to map region {addr:#x}:{len:#x}"))?;
    }

    if let Some(stack) = args.stack {
        let sp: RegId = match args.target {
            Target::X86 => X86Reg::Esp.into(),
            Target::Rv32 | Target::Rv64 => RiscvReg::SP.into(),
        };
        engine.reg_write(sp, stack).context("failed to set stack pointer")?;
    }

    if args.stop_on_interrupt {
        engine.add_intr_hook(|ctx, intno| {
            info!(intno, pc = ctx.pc(), "guest interrupt, stopping");
            ctx.stop();
        })?;
    }

    if args.trace {
        engine.add_code_hook(None, |_, event| {
            println!("{:#010x} [{}]", event.address, event.size);
        })?;
    }

    Ok((engine, image.len() as u64))
}

fn print_registers(engine: &Engine, target: Target) -> Result<()> {
    let width = target.width();
    for (name, reg) in target.registers() {
        let value = engine.reg_read(reg)?;
        println!("{name:>6} = {value:#0w$x}", w = width + 2);
    }
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let (mut engine, len) = load(args)?;
    let until = match args.until {
        Some(until) => until,
        None => args.base.checked_add(len).context("image end overflows")?,
    };
    let options = StartOptions::default()
        .with_count(args.count)
        .with_timeout(args.timeout);

    let outcome = engine.start_with_options(args.base, until, options);
    match engine.state() {
        EngineState::Stopped(reason) => println!("exit: {reason:?}"),
        EngineState::Faulted(error) => println!("fault: {error}"),
        EngineState::Idle | EngineState::Running => {}
    }
    print_registers(&engine, args.target)?;
    outcome.context("guest run failed")
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

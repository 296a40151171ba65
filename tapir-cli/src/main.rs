use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use clap::Parser;
use color_eyre::Result;
use eyre::{WrapErr, bail};
use tapir_io::{
    Hex, RegisterAccess, RegisterBus,
    usb::{self, BulkTransport, UsbControl},
};
use tapir_spinal::{Iso7816Master, iso7816::ResetKind};
use tapir_ztex::Bitstream;
use tracing::{debug, info};

use crate::cli_helpers::{UsbAddr, parse_int};

mod cli_helpers;

#[derive(clap::Parser)]
struct Args {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Args)]
struct GlobalOpts {
    #[arg(
        long,
        default_value_t = UsbAddr { vid: 0x221a, pid: 0x0100 },
        global = true,
    )]
    usb: UsbAddr,

    #[arg(long, default_value_t = 0, global = true)]
    interface: u8,

    /// Register bus OUT endpoint, defaults to the one the firmware reports
    #[arg(long, value_parser = parse_int::<u8>, global = true)]
    out_ep: Option<u8>,

    /// Register bus IN endpoint, defaults to the one the firmware reports
    #[arg(long, value_parser = parse_int::<u8>, global = true)]
    in_ep: Option<u8>,

    /// Disable the progress bar
    #[arg(long, global = true)]
    no_progress_bar: bool,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Board information and FPGA state
    Info,
    Program(Program),
    Read(Read),
    Write(Write),
    Dump(Dump),
    Poll(Poll),
    Atr(Atr),
}

#[derive(clap::Args)]
struct Program {
    input_file: PathBuf,
}

#[derive(clap::Args)]
struct Read {
    #[arg(value_parser = parse_int::<u32>)]
    address: u32,
}

#[derive(clap::Args)]
struct Write {
    #[arg(value_parser = parse_int::<u32>)]
    address: u32,
    #[arg(value_parser = parse_int::<u32>)]
    value: u32,
}

#[derive(clap::Args)]
struct Dump {
    #[arg(value_parser = parse_int::<u32>)]
    address: u32,
    #[arg(value_parser = parse_int::<usize>)]
    len: usize,
}

#[derive(clap::Args)]
struct Poll {
    #[arg(value_parser = parse_int::<u32>)]
    address: u32,
    #[arg(value_parser = parse_int::<u32>)]
    mask: u32,
    #[arg(value_parser = parse_int::<u32>)]
    expected: u32,
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

/// Cold-reset an ISO7816 master and print the card's ATR
#[derive(clap::Args)]
struct Atr {
    #[arg(value_parser = parse_int::<u32>)]
    base: u32,
    /// Per-fragment receive deadline
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    init_logging()?;
    let Args { global, command } = Args::parse();

    let device = smol::block_on(usb::open(global.usb.vid, global.usb.pid))
        .wrap_err_with(|| format!("failed to open device {}", global.usb))?;
    let iface = smol::block_on(usb::claim(&device, global.interface))?;
    let mut ctrl = UsbControl::new(iface.clone());

    match command {
        CliCommand::Info => smol::block_on(show_info(&mut ctrl)),
        CliCommand::Program(args) => program(&mut ctrl, args, global.no_progress_bar),
        command => smol::block_on(async {
            let mut bus = open_bus(&mut ctrl, iface, &global).await?;
            run(command, &mut bus).await
        }),
    }
}

fn setup_progress_bar() -> Result<indicatif::ProgressBar> {
    let template =
        "{spinner:.green} {elapsed:>3}/{duration:>3} {bar} {bytes}/{total_bytes} ({bytes_per_sec})";
    let style = indicatif::ProgressStyle::with_template(template)?;
    let pb = indicatif::ProgressBar::new(0)
        .with_finish(indicatif::ProgressFinish::Abandon)
        .with_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn show_info(ctrl: &mut UsbControl) -> Result<()> {
    let info = tapir_ztex::device_info(ctrl).await?;
    println!("{info}");
    let state = if tapir_ztex::is_configured(ctrl).await? {
        "configured"
    } else {
        "unconfigured"
    };
    println!("fpga: {state}");
    Ok(())
}

fn program(ctrl: &mut UsbControl, args: Program, no_progress_bar: bool) -> Result<()> {
    let bitstream = Bitstream::load(&args.input_file)
        .wrap_err_with(|| format!("failed to load {}", args.input_file.display()))?;
    info!(
        len = bitstream.len(),
        reversed = bitstream.is_reversed(),
        padded = bitstream.is_padded(),
        "bitstream"
    );

    if no_progress_bar {
        smol::block_on(tapir_ztex::upload(ctrl, bitstream, None))?;
        return Ok(());
    }

    let notify = &AtomicUsize::new(0);
    let done = &AtomicBool::new(false);
    let pb = &setup_progress_bar()?;
    pb.set_length(bitstream.len() as _);
    std::thread::scope(|s| {
        s.spawn(move || {
            while !done.load(Ordering::Acquire) {
                pb.set_position(notify.load(Ordering::Acquire) as _);
                std::thread::sleep(Duration::from_millis(20));
            }
            pb.set_position(notify.load(Ordering::Acquire) as _);
        });

        let r = smol::block_on(tapir_ztex::upload(ctrl, bitstream, Some(notify)));
        done.store(true, Ordering::Release);
        r
    })?;
    Ok(())
}

/// Register bus on the requested endpoints, asking the firmware for any
/// that were not given.
async fn open_bus(
    ctrl: &mut UsbControl,
    iface: nusb::Interface,
    global: &GlobalOpts,
) -> Result<RegisterBus<BulkTransport>> {
    let (out_ep, in_ep) = match (global.out_ep, global.in_ep) {
        (Some(out_ep), Some(in_ep)) => (out_ep, in_ep),
        (out_ep, in_ep) => {
            let info = tapir_ztex::device_info(ctrl).await?;
            (
                out_ep.unwrap_or(info.default_out_ep),
                in_ep.unwrap_or(info.default_in_ep),
            )
        }
    };
    debug!(out_ep = %Hex(out_ep), in_ep = %Hex(in_ep), "register bus");
    Ok(RegisterBus::new(BulkTransport::new(iface, out_ep, in_ep)))
}

async fn run(command: CliCommand, regs: &mut impl RegisterAccess) -> Result<()> {
    match command {
        // no register bus, handled earlier
        CliCommand::Info | CliCommand::Program(_) => unreachable!(),

        CliCommand::Read(Read { address }) => {
            let value = regs.read(address).await?;
            println!("{address:#06x}: {} ({value})", Hex(value));
        }
        CliCommand::Write(Write { address, value }) => {
            regs.write(address, value).await?;
        }
        CliCommand::Dump(Dump { address, len }) => {
            let mut buf = vec![0; len];
            regs.read_stream(address, &mut buf).await?;
            for (idx, line) in buf.chunks(16).enumerate() {
                println!("{:04x}: {}", idx * 16, hex::encode(line));
            }
        }
        CliCommand::Poll(Poll {
            address,
            mask,
            expected,
            timeout_ms,
        }) => {
            let deadline = Duration::from_millis(timeout_ms);
            if !regs.poll(address, mask, expected, deadline).await? {
                bail!(
                    "{address:#06x} & {} != {} after {timeout_ms} ms",
                    Hex(mask),
                    Hex(expected)
                );
            }
            println!("matched");
        }
        CliCommand::Atr(Atr { base, timeout_ms }) => {
            let mut iso = Iso7816Master::new(regs, base).await?;
            iso.reset_and_activate(ResetKind::Cold, true).await?;
            let atr = iso.receive_atr(Duration::from_millis(timeout_ms)).await?;
            println!("atr: {}", hex::encode_upper(atr.as_bytes()));
            println!("historical: {}", hex::encode_upper(atr.historical_bytes()));
            let protocols: Vec<_> = atr.protocols().map(|t| format!("T={t}")).collect();
            println!("protocols: {}", protocols.join(" "));
            match atr.checksum_ok() {
                Some(true) => println!("checksum: ok"),
                Some(false) => println!("checksum: mismatch"),
                None => println!("checksum: absent"),
            }
        }
    }

    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .with(tracing_error::ErrorLayer::default())
        .init();
    color_eyre::install()?;
    Ok(())
}

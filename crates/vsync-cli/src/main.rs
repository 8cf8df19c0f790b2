//! `vsync`: command-line interface for DKL PHY PLL control.
//!
//! ```text
//! USAGE:
//!   vsync enumerate                      List display controllers
//!   vsync info <device>                  PCI details for one device
//!   vsync dump <device> [--phy N]        PLL registers of the DKL PHYs
//!   vsync shift <device> --delta-ms D    Move the vblank by D ms
//!   vsync genlock <device>               Lock to offsets read from stdin
//! ```
//!
//! `shift` and `genlock` restore the PLL registers on SIGINT / SIGTERM.
//!
//! `<device>` is a PCI address (`0000:00:02.0`) or an index into the list
//! printed by `enumerate`. `--simulate` runs every command against an
//! in-memory Tiger Lake register file instead.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vsync_driver::vblank::VblankReport;
use vsync_driver::{
    ChannelSource, DeviceHandle, DeviceManager, DklCodec, GenlockConfig, GenlockLoop,
    OffsetAcquirer, PciDevice, ShiftPhase, ShiftSession, SoftwareDevice, SyncFeed, SyncReading,
    SysfsBackend, SYSFS_PCI_DEVICES,
};

#[derive(Parser)]
#[command(name = "vsync", about = "DKL display PLL control and genlock", version)]
struct Cli {
    /// PCI sysfs device directory.
    #[arg(long, global = true, default_value = SYSFS_PCI_DEVICES)]
    sysfs_root: PathBuf,

    /// Use a simulated Tiger Lake iGPU (PHYs 0 and 1 active).
    #[arg(long, global = true)]
    simulate: bool,

    /// More log output (-v info, -vv debug); RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List display controllers.
    Enumerate,
    /// Print PCI details for one device.
    Info {
        /// PCI address (e.g. 0000:00:02.0) or display index (e.g. 0).
        device: String,
    },
    /// Dump the PLL registers of the DKL PHYs.
    Dump {
        /// PCI address or display index.
        device: String,
        /// Dump only this PHY, even if it looks disabled.
        #[arg(long)]
        phy: Option<usize>,
    },
    /// Shift the vblank phase by a time difference.
    Shift {
        /// PCI address or display index.
        device: String,
        /// Local minus reference vblank time in ms (positive slows down).
        #[arg(long, allow_hyphen_values = true)]
        delta_ms: f64,
        /// Frequency offset in percent.
        #[arg(long)]
        shift: Option<f64>,
        /// Larger offset for differences above --step-threshold-us.
        #[arg(long)]
        shift2: Option<f64>,
        /// Difference in µs from which --shift2 applies.
        #[arg(long)]
        step_threshold_us: Option<u64>,
        /// Leave the PLLs shifted after the hold.
        #[arg(long)]
        no_reset: bool,
        /// Only print the plan.
        #[arg(long)]
        dry_run: bool,
    },
    /// Lock the PLLs to readings from stdin.
    ///
    /// With `--source offset`, one reading per line: `offset_ns drift_ppm
    /// synced`, where drift_ppm may be `-` and synced is 1/0. With
    /// `--source vblank`: `local_us ref_us...`, the local vblank timestamp
    /// followed by the reference's recent vblank timestamps, oldest first.
    /// The loop stops and restores the registers when stdin closes.
    Genlock {
        /// PCI address or display index.
        device: String,
        /// Format of the stdin readings.
        #[arg(long, value_enum, default_value_t = Source::Offset)]
        source: Source,
        /// Cycle period in ms.
        #[arg(long)]
        period_ms: Option<u64>,
        /// Offset to steer to, in ns.
        #[arg(long, allow_hyphen_values = true)]
        target_offset_ns: Option<i64>,
        /// Offset error still counted as locked, in ns.
        #[arg(long)]
        tolerance_ns: Option<i64>,
    },
}

/// What each stdin line of `genlock` carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Clock offset from a PTP client
    Offset,
    /// Vblank timestamps of both systems
    Vblank,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let mut config = GenlockConfig::from_env().context("reading VSYNC_* settings")?;

    match &cli.command {
        Cmd::Enumerate => cmd_enumerate(&cli)?,
        Cmd::Info { device } => cmd_info(&cli, device)?,
        Cmd::Dump { device, phy } => cmd_dump(&cli, &config, device, *phy)?,
        Cmd::Shift {
            device,
            delta_ms,
            shift,
            shift2,
            step_threshold_us,
            no_reset,
            dry_run,
        } => {
            let s = &mut config.shift;
            s.shift_percent = shift.unwrap_or(s.shift_percent);
            s.shift2_percent = shift2.unwrap_or(s.shift2_percent);
            s.step_threshold_us = step_threshold_us.unwrap_or(s.step_threshold_us);
            s.reset &= !no_reset;
            s.commit &= !dry_run;
            config.validate()?;
            cmd_shift(&cli, &config, device, *delta_ms)?;
        }
        Cmd::Genlock {
            device,
            source,
            period_ms,
            target_offset_ns,
            tolerance_ns,
        } => {
            let c = &mut config.controller;
            c.period = period_ms.map_or(c.period, Duration::from_millis);
            c.target_offset_ns = target_offset_ns.unwrap_or(c.target_offset_ns);
            c.tolerance_ns = tolerance_ns.unwrap_or(c.tolerance_ns);
            config.validate()?;
            cmd_genlock(&cli, &config, device, *source)?;
        }
    }

    Ok(())
}

/// Resolve `device` to a PCI function without checking support
fn find_device(cli: &Cli, device: &str) -> Result<PciDevice> {
    if cli.simulate {
        return Ok(PciDevice::simulated());
    }
    let mgr = discover(&cli.sysfs_root)?;
    if let Ok(index) = device.parse::<usize>() {
        return mgr
            .displays()
            .nth(index)
            .cloned()
            .ok_or_else(|| anyhow!("no display controller with index {index}"));
    }
    mgr.devices()
        .iter()
        .find(|d| d.address == device)
        .cloned()
        .ok_or_else(|| anyhow!("device not found: {device}"))
}

fn discover(root: &Path) -> Result<DeviceManager> {
    DeviceManager::discover_in(root).with_context(|| format!("scanning {}", root.display()))
}

/// Open and map a supported device
fn open_device(cli: &Cli, device: &str) -> Result<DeviceHandle> {
    let mut handle = if cli.simulate {
        DeviceHandle::simulated(SoftwareDevice::with_active_phys(&[0, 1]))
    } else {
        let info = find_device(cli, device)?;
        info.ensure_supported()?;
        DeviceHandle::with_backend(info, Box::new(SysfsBackend::new()))
    };
    handle
        .map()
        .with_context(|| format!("mapping registers of {}", handle.info().address))?;
    Ok(handle)
}

fn cmd_enumerate(cli: &Cli) -> Result<()> {
    let devices: Vec<PciDevice> = if cli.simulate {
        vec![PciDevice::simulated()]
    } else {
        discover(&cli.sysfs_root)?.displays().cloned().collect()
    };

    println!("Display controllers: {}", devices.len());
    println!();
    for (index, info) in devices.iter().enumerate() {
        let support = match info.ensure_supported() {
            Ok(()) => format!("{} DKL PHYs", info.platform.dkl_phy_count()),
            Err(e) => format!("unsupported: {e}"),
        };
        println!(
            "[{index}] {} @ {}  ({:04x}:{:04x})",
            info.platform.name(),
            info.address,
            info.vendor_id,
            info.device_id
        );
        println!("     {support}");
    }
    Ok(())
}

fn cmd_info(cli: &Cli, device: &str) -> Result<()> {
    let info = find_device(cli, device)?;

    println!("Device       : {}", info.sysfs_path.display());
    println!("PCI address  : {}", info.address);
    println!("Vendor:device: {:04x}:{:04x}", info.vendor_id, info.device_id);
    println!("Class        : {:06x}", info.class_code);
    println!("Platform     : {}", info.platform.name());
    println!("IRQ          : {}", info.irq);
    for (i, bar) in info.bars.iter().enumerate().filter(|(_, b)| b.is_present()) {
        println!(
            "BAR{i}         : {:#014x} size {:#x} flags {:#x}",
            bar.base, bar.size, bar.flags
        );
    }
    match info.ensure_supported() {
        Ok(()) => println!("DKL PHYs     : {}", info.platform.dkl_phy_count()),
        Err(e) => println!("Supported    : no ({e})"),
    }
    Ok(())
}

/// Set `stop` on SIGINT and SIGTERM
fn stop_on_signals(stop: &Arc<AtomicBool>) -> Result<()> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(stop))
            .with_context(|| format!("registering handler for signal {signal}"))?;
    }
    Ok(())
}

fn cmd_dump(cli: &Cli, config: &GenlockConfig, device: &str, phy: Option<usize>) -> Result<()> {
    let mut dev = open_device(cli, device)?;
    let mut codec = DklCodec::for_device(&dev, config.layout, config.retune);
    let count = codec.phy_count();

    let phys = match phy {
        Some(phy) if phy >= count => return Err(anyhow!("PHY {phy} out of range 0..{count}")),
        Some(phy) => vec![phy],
        None => codec.find_enabled_phys(&mut dev)?,
    };
    if phys.is_empty() {
        println!("No enabled DKL PHYs on {}", dev.info().address);
    }
    for phy in phys {
        let regs = codec.select(&mut dev, phy)?.read_registers()?;
        print!("{}", regs.describe(phy, codec.layout()));
    }
    Ok(())
}

fn cmd_shift(cli: &Cli, config: &GenlockConfig, device: &str, delta_ms: f64) -> Result<()> {
    let mut dev = open_device(cli, device)?;
    let mut codec = DklCodec::for_device(&dev, config.layout, config.retune);
    let stop = Arc::new(AtomicBool::new(false));
    stop_on_signals(&stop)?;

    let mut session = ShiftSession::start(&mut dev, &mut codec, delta_ms, &config.shift, Instant::now())
        .context("starting phase shift")?;
    let plan = *session.plan();
    println!(
        "Shift {delta_ms} ms: {:?} by {}% for {} ms",
        plan.direction,
        plan.shift_percent,
        plan.hold.as_millis()
    );
    for &(phy, mhz) in session.phys() {
        println!("  PHY {phy}: {mhz:.6} MHz -> {:.6} MHz", plan.target_mhz(mhz));
    }
    if session.phase() == ShiftPhase::Done {
        return Ok(());
    }

    session.run_to_completion(&stop)?;
    if stop.load(Ordering::Relaxed) {
        println!("Interrupted, registers restored");
    } else {
        println!("Done");
    }
    Ok(())
}

fn cmd_genlock(cli: &Cli, config: &GenlockConfig, device: &str, format: Source) -> Result<()> {
    let dev = open_device(cli, device)?;
    let codec = DklCodec::for_device(&dev, config.layout, config.retune);
    let (feed, source) = ChannelSource::pair();
    let lp = GenlockLoop::new(
        dev,
        codec,
        OffsetAcquirer::new(source, config.acquirer),
        config.controller,
    )?;
    let monitor = lp.monitor();
    let stop = Arc::new(AtomicBool::new(false));
    stop_on_signals(&stop)?;

    {
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("stdin-readings".into())
            .spawn(move || {
                feed_from(io::stdin().lock(), &feed, format);
                info!("stdin closed, stopping");
                stop.store(true, Ordering::Relaxed);
            })
            .context("spawning stdin reader")?;
    }

    let handle = lp.spawn(Arc::clone(&stop))?;
    let mut last = None;
    while !handle.is_finished() {
        thread::sleep(config.controller.period);
        let snap = monitor.snapshot();
        if last == Some(snap.control.cycles) {
            continue;
        }
        last = Some(snap.control.cycles);
        let c = &snap.control;
        println!(
            "{:<10} offset {:>10} ns  correction {:>9.3} ppm  applied {:>9.3} ppm  good {}",
            c.state,
            c.last_offset_ns.map_or_else(|| "-".to_string(), |o| o.to_string()),
            c.correction_ppm,
            c.applied_ppm,
            c.good_samples
        );
    }

    handle
        .join()
        .map_err(|_| anyhow!("genlock thread panicked"))?
        .context("genlock loop")?;
    Ok(())
}

/// Push every reading from `input` until it closes or the loop is gone
fn feed_from(input: impl BufRead, feed: &SyncFeed, format: Source) {
    let started = Instant::now();
    for line in input.lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = match format {
            Source::Offset => {
                let reference_ns = i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX);
                parse_reading(line, reference_ns)
            }
            Source::Vblank => parse_vblank(line).map(|r| r.into_reading(Instant::now())),
        };
        match parsed {
            Ok(reading) => {
                if !feed.push(reading) {
                    break;
                }
            }
            Err(e) => warn!("Ignoring {line:?}: {e}"),
        }
    }
}

/// Parse `offset_ns drift_ppm synced`
fn parse_reading(line: &str, reference_ns: i64) -> Result<SyncReading> {
    let mut fields = line.split_whitespace();
    let mut next = |name: &str| fields.next().ok_or_else(|| anyhow!("missing {name}"));

    let offset_ns: i64 = next("offset_ns")?.parse().context("offset_ns")?;
    let drift = next("drift_ppm")?;
    let synced = match next("synced")? {
        "1" | "true" | "yes" => true,
        "0" | "false" | "no" => false,
        other => return Err(anyhow!("synced must be 1 or 0, got {other}")),
    };

    if !synced {
        return Ok(SyncReading::unsynchronized());
    }
    let reading = SyncReading::locked(offset_ns, reference_ns);
    Ok(match drift {
        "-" => reading,
        d => reading.with_drift(d.parse().context("drift_ppm")?),
    })
}

/// Parse `local_us ref_us...`
fn parse_vblank(line: &str) -> Result<VblankReport> {
    let mut fields = line.split_whitespace().map(|f| {
        f.parse::<i64>()
            .with_context(|| format!("timestamp {f:?}"))
    });
    let local_us = fields.next().ok_or_else(|| anyhow!("missing local_us"))??;
    let reference_us = fields.collect::<Result<Vec<_>>>()?;
    if reference_us.is_empty() {
        return Err(anyhow!("missing reference timestamps"));
    }
    Ok(VblankReport {
        reference_us,
        local_us,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_readings() {
        let r = parse_reading("1500 -2.5 1", 10).unwrap();
        assert!(r.synchronized);
        assert_eq!(r.offset_ns, 1500);
        assert_eq!(r.drift_ppm, Some(-2.5));
        assert_eq!(r.reference_time_ns, 10);

        let r = parse_reading("-20 - true", 0).unwrap();
        assert_eq!(r.offset_ns, -20);
        assert_eq!(r.drift_ppm, None);

        assert!(!parse_reading("0 0 0", 0).unwrap().synchronized);
    }

    #[test]
    fn rejects_bad_readings() {
        assert!(parse_reading("", 0).is_err());
        assert!(parse_reading("12", 0).is_err());
        assert!(parse_reading("x 0 1", 0).is_err());
        assert!(parse_reading("1 0 maybe", 0).is_err());
    }

    #[test]
    fn feed_skips_comments_and_garbage() {
        let (feed, mut source) = ChannelSource::pair();
        let input = "# offset drift synced\n\n100 - 1\nnonsense\n200 0.5 1\n";
        feed_from(input.as_bytes(), &feed, Source::Offset);

        use vsync_driver::TimeSyncSource;
        let r = source.query(Duration::from_millis(10)).unwrap();
        assert_eq!(r.offset_ns, 200);
    }

    #[test]
    fn parses_vblank_lines() {
        let r = parse_vblank("1050040 1000000 1016667 1033334").unwrap();
        assert_eq!(r.local_us, 1_050_040);
        assert_eq!(r.reference_us, [1_000_000, 1_016_667, 1_033_334]);

        assert!(parse_vblank("").is_err());
        assert!(parse_vblank("1000").is_err());
        assert!(parse_vblank("1000 x 2000").is_err());
    }

    #[test]
    fn vblank_feed_folds_into_one_period() {
        let (feed, mut source) = ChannelSource::pair();
        // Local vblank 40 µs after the reference's, two frames later
        feed_from(
            "1066708 1000000 1016667 1033334\n".as_bytes(),
            &feed,
            Source::Vblank,
        );

        use vsync_driver::TimeSyncSource;
        let r = source.query(Duration::from_millis(10)).unwrap();
        assert!(r.synchronized);
        assert_eq!(r.offset_ns, 40_000);
    }

    #[test]
    fn genlock_source_flag() {
        let cli = Cli::try_parse_from(["vsync", "genlock", "0", "--source", "vblank"]).unwrap();
        assert!(matches!(cli.command, Cmd::Genlock { source: Source::Vblank, .. }));
        let cli = Cli::try_parse_from(["vsync", "genlock", "0"]).unwrap();
        assert!(matches!(cli.command, Cmd::Genlock { source: Source::Offset, .. }));
    }

    #[test]
    fn signals_set_stop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        stop_on_signals(&stop).unwrap();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from([
            "vsync", "--simulate", "-vv", "shift", "0", "--delta-ms", "-1.5", "--dry-run",
        ])
        .unwrap();
        assert!(cli.simulate);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Cmd::Shift { delta_ms, dry_run: true, .. } if delta_ms == -1.5));
    }
}

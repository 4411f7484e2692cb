use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use odin_core::events::{FlashEvent, FlashObserver};
use odin_core::flasher::Flasher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "odin",
    author,
    version,
    about = "Samsung download-mode flasher (Pure Rust)",
    long_about = "Flashes Samsung firmware distributions over the Odin/Loke download-mode protocol."
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices currently in download mode
    List,

    /// Flash a firmware distribution
    Flash {
        /// Firmware archive (.tar or .tar.md5)
        firmware: PathBuf,

        /// PIT file uploaded in place of the device's table
        #[arg(long)]
        pit: Option<PathBuf>,

        /// Reboot the device after flashing
        #[arg(long)]
        reboot: bool,

        /// Check the archive digest before flashing
        #[arg(long)]
        verify: bool,
    },

    /// Receive the device's PIT and write it to a file
    DumpPit {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show the members, embedded PIT and digest of an archive
    Inspect {
        /// Firmware archive (.tar or .tar.md5)
        firmware: PathBuf,
    },
}

/// CLI observer that prints progress to stderr.
struct CliObserver {
    verbose: bool,
}

impl FlashObserver for CliObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid } => {
                eprintln!("device connected: {vid:04X}:{pid:04X}");
            }
            FlashEvent::DeviceDisconnected => {
                eprintln!("device released");
            }
            FlashEvent::PhaseChanged { from, to } => {
                if self.verbose {
                    eprintln!("phase: {from} -> {to}");
                }
            }
            FlashEvent::MemberStarted {
                name,
                partition_id,
                total,
            } => {
                eprintln!("{name} -> partition {partition_id} ({total} bytes)");
            }
            FlashEvent::Progress {
                name,
                sent,
                total,
                percent,
            } => {
                eprint!("\r[{percent:>3}%] {name}: {sent}/{total}");
                if sent == total {
                    eprintln!();
                }
            }
            FlashEvent::MemberCompleted { name } => {
                if self.verbose {
                    eprintln!("{name} done");
                }
            }
            FlashEvent::PitReceived { bytes } => {
                eprintln!("PIT received ({bytes} bytes)");
            }
            FlashEvent::Log { message, .. } => {
                if self.verbose {
                    eprintln!("{message}");
                }
            }
            FlashEvent::Error { message } => {
                eprintln!("error: {message}");
            }
            FlashEvent::Complete => {
                eprintln!("all done");
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match args.command {
        Command::List => {
            let devices = Flasher::list_devices()?;
            if devices.is_empty() {
                eprintln!("no device in download mode");
            }
            for d in devices {
                println!(
                    "[{:04x}:{:04x}] {} {} (serial {})",
                    d.vendor_id,
                    d.product_id,
                    d.manufacturer.as_deref().unwrap_or("?"),
                    d.product.as_deref().unwrap_or("?"),
                    d.serial.as_deref().unwrap_or("?"),
                );
            }
        }

        Command::Flash {
            firmware,
            pit,
            reboot,
            verify,
        } => {
            let observer = Arc::new(CliObserver {
                verbose: args.verbose,
            });
            let mut flasher = Flasher::with_observer(observer);

            let file = std::fs::File::open(&firmware)
                .with_context(|| format!("opening {}", firmware.display()))?;
            let mut fw = flasher.load_firmware(Box::new(file))?;
            info!(members = fw.members.len(), "firmware loaded");

            if verify {
                match fw.verify_md5()? {
                    Some(true) => eprintln!("archive digest OK"),
                    Some(false) => bail!("archive digest mismatch"),
                    None => eprintln!("archive carries no digest, skipping check"),
                }
            }

            let pit_bytes = match &pit {
                Some(path) => Some(
                    std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
                ),
                None => None,
            };

            flasher.connect()?;
            let summary = flasher.flash(&mut fw, pit_bytes.as_deref(), reboot)?;
            println!(
                "flashed {} members, {} bytes",
                summary.members_flashed, summary.bytes_sent
            );
            flasher.disconnect();
        }

        Command::DumpPit { output } => {
            let mut flasher = Flasher::new();
            flasher.connect()?;
            let pit = flasher.dump_pit()?;
            std::fs::write(&output, &pit)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote {} bytes to {}", pit.len(), output.display());
            flasher.disconnect();
        }

        Command::Inspect { firmware } => {
            let file = std::fs::File::open(&firmware)
                .with_context(|| format!("opening {}", firmware.display()))?;
            let fw = odin_core::Firmware::load(Box::new(file))?;

            println!("{:<40} {:>12}  compression", "member", "bytes");
            for m in &fw.members {
                println!(
                    "{:<40} {:>12}  {:?}",
                    m.name, m.size, m.compression
                );
            }
            if let Some(md5) = &fw.md5 {
                println!("outer md5: {md5}");
            }
            if let Some(pit) = &fw.embedded_pit {
                match odin_core::Pit::parse(pit) {
                    Ok(parsed) => {
                        println!("embedded PIT with {} entries:", parsed.entries.len());
                        for e in &parsed.entries {
                            println!(
                                "  {:>3}  {:<24} {}",
                                e.partition_id, e.partition_name, e.flash_filename
                            );
                        }
                    }
                    Err(e) => println!("embedded PIT does not parse: {e}"),
                }
            }
        }
    }

    Ok(())
}

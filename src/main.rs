use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use clap::{ArgAction, Parser, Subcommand};

use md1702::codeplug::SortOrder;
use md1702::transport::UsbTransport;
use md1702::{Codeplug, Dfu, FlashImage, FlashReader, InfoField, MessageKind, RecordingArea, format, recording};

#[derive(Parser)]
#[command(
    name = "md1702",
    version,
    about = "Maintenance tool for MD1702 / DM-1702 DMR handhelds: codeplug, firmware, recordings"
)]
struct Cli {
    /// More output, repeat for trace level (frame dumps)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// USB timeout in milliseconds for interactive commands
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show firmware version, address ranges and device id
    Info,
    /// Read the raw codeplug into a file
    ReadCodeplug { path: PathBuf },
    /// Write a raw codeplug file (not the vendor CPS format)
    WriteCodeplug { path: PathBuf },
    /// Dump the firmware from internal flash
    ReadFirmware { path: PathBuf },
    /// Dump the internal configuration block
    ReadConfig { path: PathBuf },
    /// Read voice prompts
    ReadVoice { path: PathBuf },
    /// Write voice prompts; stock vendor files are accepted
    WriteVoice { path: PathBuf },
    /// Read the character font
    ReadFont { path: PathBuf },
    WriteFont { path: PathBuf },
    /// Read the boot logo region as raw bytes
    ReadLogo { path: PathBuf },
    WriteLogo { path: PathBuf },
    /// Dump the SPI flash, by default all of it
    ReadSpi {
        /// Output file, hex dump to the terminal when omitted
        path: Option<PathBuf>,
        #[arg(long, value_parser = parse_number, default_value = "0")]
        start: u32,
        /// Last address, inclusive
        #[arg(long, value_parser = parse_number)]
        end: Option<u32>,
        /// Keep the trailing erased bytes
        #[arg(long)]
        raw: bool,
    },
    /// Set the radio clock (radio in normal mode), default is now
    SetTime {
        /// "YYYY-MM-DD HH:MM:SS" or "MM/DD/YYYY HH:MM:SS"
        time: Option<String>,
    },
    /// Leave maintenance mode
    Reboot,
    /// Flash an unencrypted firmware through the bootloader
    Upgrade { path: PathBuf },
    /// Check the bootloader handshake and version without flashing,
    /// optionally validating a firmware file first
    UpgradeCheck { path: Option<PathBuf> },
    /// Save call recordings as <PREFIX><name>.dmr
    Recordings {
        prefix: String,
        /// Also scan for recordings lost from the index (slow)
        #[arg(long)]
        all: bool,
        /// Only recordings newer than this time
        #[arg(long)]
        newer_than: Option<String>,
        #[command(flatten)]
        source: FlashSource,
    },
    /// Show the state of the recording area
    RecordingInfo {
        #[command(flatten)]
        source: FlashSource,
    },
    /// Print text messages of a codeplug
    Messages {
        /// Raw codeplug file, read from the radio when omitted
        codeplug: Option<PathBuf>,
        #[arg(long, value_enum)]
        kind: Option<MessageKind>,
        /// Walk every slot, showing deleted messages too
        #[arg(long)]
        scan: bool,
    },
    /// Print the contact list of a codeplug
    Contacts {
        codeplug: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "call-sign")]
        sort: SortOrder,
        /// Also list the contacts bound to buttons and channels
        #[arg(long)]
        assignments: bool,
    },
}

#[derive(clap::Args)]
struct FlashSource {
    /// SPI flash dump to read instead of the radio
    #[arg(long)]
    image: Option<PathBuf>,
    /// Firmware revision the dump was taken with
    #[arg(long, default_value_t = 22)]
    firmware_revision: u32,
    /// Sectors missing at the beginning of the dump
    #[arg(long, default_value_t = 0)]
    leading_blocks: usize,
}

fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{:?}: {}", s, e))
}

fn parse_time(s: &str) -> Result<NaiveDateTime> {
    for fmt in ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    bail!("use \"YYYY-MM-DD HH:MM:SS\" or \"MM/DD/YYYY HH:MM:SS\" as the date string")
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    log::info!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn open_dfu(cli: &Cli) -> Result<Dfu<UsbTransport>> {
    let mut dfu = Dfu::new_from_usb()?;
    dfu.set_progress(true);
    if let Some(ms) = cli.timeout {
        dfu.set_timeout(Duration::from_millis(ms));
    }
    Ok(dfu)
}

fn load_codeplug(cli: &Cli, path: Option<&Path>) -> Result<Codeplug> {
    match path {
        Some(path) => Ok(Codeplug::from_file(path)?),
        None => {
            let mut dfu = open_dfu(cli)?;
            let image = dfu.read_codeplug()?;
            dfu.reboot()?;
            Ok(Codeplug::from_bytes(image)?)
        }
    }
}

fn recording_session(cli: &Cli, source: &FlashSource) -> Result<(Box<dyn FlashReader>, RecordingArea)> {
    if let Some(path) = &source.image {
        let image = FlashImage::from_file(path, source.firmware_revision, source.leading_blocks)?;
        let area = image.default_area()?;
        return Ok((Box::new(image), area));
    }
    let mut dfu = open_dfu(cli)?;
    dfu.set_progress(false);
    let (start, end) = dfu.verify_addrs(InfoField::Recordings)?;
    dfu.enter_spi_usb_mode()?;
    let revision = dfu.firmware_revision()?;
    let area = RecordingArea::new(start, end, revision)?;
    Ok((Box::new(dfu), area))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match &cli.command {
        Commands::Info => {
            let mut dfu = open_dfu(&cli)?;
            dfu.dump_info()?;
            dfu.reboot()?;
        }
        Commands::ReadCodeplug { path } => {
            let mut dfu = open_dfu(&cli)?;
            let image = dfu.read_codeplug()?;
            dfu.reboot()?;
            write_file(path, &image)?;
        }
        Commands::WriteCodeplug { path } => {
            let image = read_file(path)?;
            format::check_codeplug(&image)?;
            let mut dfu = open_dfu(&cli)?;
            dfu.write_codeplug(&image)?;
            dfu.reboot()?;
        }
        Commands::ReadFirmware { path } => {
            let mut dfu = open_dfu(&cli)?;
            let image = dfu.read_firmware()?;
            dfu.reboot()?;
            write_file(path, &image)?;
        }
        Commands::ReadConfig { path } => {
            let mut dfu = open_dfu(&cli)?;
            let image = dfu.read_config()?;
            dfu.reboot()?;
            write_file(path, &image)?;
        }
        Commands::ReadVoice { path } => read_region(&cli, InfoField::Voices, path, true)?,
        Commands::ReadFont { path } => read_region(&cli, InfoField::HzkFont, path, true)?,
        Commands::ReadLogo { path } => read_region(&cli, InfoField::Logo, path, false)?,
        Commands::WriteVoice { path } => {
            let data = read_file(path)?;
            write_region(&cli, InfoField::Voices, format::strip_stock_voice_header(&data))?;
        }
        Commands::WriteFont { path } => write_region(&cli, InfoField::HzkFont, &read_file(path)?)?,
        Commands::WriteLogo { path } => write_region(&cli, InfoField::Logo, &read_file(path)?)?,
        Commands::ReadSpi {
            path,
            start,
            end,
            raw,
        } => {
            let mut dfu = open_dfu(&cli)?;
            let data = dfu.read_spi(*start, *end, !*raw)?;
            dfu.reboot()?;
            match path {
                Some(path) => write_file(path, &data)?,
                None => println!("{}", format::hexdump(&data)?),
            }
        }
        Commands::SetTime { time } => {
            let time = time.as_deref().map(parse_time).transpose()?;
            let mut dfu = Dfu::open_usb()?;
            dfu.set_time(time)?;
        }
        Commands::Reboot => {
            let mut dfu = open_dfu(&cli)?;
            dfu.reboot()?;
        }
        Commands::Upgrade { path } => {
            let image = format::read_firmware_from_file(path)?;
            format::check_firmware(&image)?;
            log::info!("Firmware size: {}", image.len());
            log::info!("Power the radio on while holding the bootloader key");
            let mut dfu = Dfu::open_usb()?;
            dfu.set_progress(true);
            dfu.enter_bootloader_mode()?;
            dfu.download_firmware(&image, &path.to_string_lossy())?;
        }
        Commands::UpgradeCheck { path } => {
            if let Some(path) = path {
                let image = format::read_firmware_from_file(path)?;
                format::check_firmware(&image)?;
                log::info!("Firmware {} ({} bytes) passed the checks", path.display(), image.len());
            }
            log::info!("Power the radio on while holding the bootloader key");
            let mut dfu = Dfu::open_usb()?;
            dfu.enter_bootloader_mode()?;
            log::info!(
                "Bootloader version {} is supported, please turn off the radio now",
                dfu.loader_version().unwrap_or_default()
            );
        }
        Commands::Recordings {
            prefix,
            all,
            newer_than,
            source,
        } => {
            let newer_than = newer_than.as_deref().map(parse_time).transpose()?;
            let (mut reader, area) = recording_session(&cli, source)?;
            let recordings = recording::collect_recordings(reader.as_mut(), &area, *all)?;
            log::info!("Found {} recordings", recordings.len());
            let saved =
                recording::save_recordings(reader.as_mut(), &area, &recordings, prefix, newer_than)?;
            log::info!("Saved {} recordings", saved);
        }
        Commands::RecordingInfo { source } => {
            let (mut reader, area) = recording_session(&cli, source)?;
            let summary = recording::area_summary(reader.as_mut(), &area)?;
            print!("{}", summary);
        }
        Commands::Messages {
            codeplug,
            kind,
            scan,
        } => {
            let codeplug = load_codeplug(&cli, codeplug.as_deref())?;
            let contacts = codeplug.contacts()?;
            let kinds = match kind {
                Some(kind) => vec![*kind],
                None => MessageKind::ALL.to_vec(),
            };
            for kind in kinds {
                let Some(messages) = codeplug.messages(kind, *scan, Some(&contacts))? else {
                    log::warn!("No {} messages storage in this codeplug", kind);
                    continue;
                };
                for (i, msg) in messages.iter().enumerate() {
                    println!(
                        "MSG,{},{},{},{},{},{}",
                        kind,
                        i,
                        msg.dmr_id.map(|id| id.to_string()).unwrap_or_default(),
                        msg.call_sign.as_deref().unwrap_or_default(),
                        msg.status.map(|s| s.to_string()).unwrap_or_default(),
                        msg.text
                    );
                }
            }
        }
        Commands::Contacts {
            codeplug,
            sort,
            assignments,
        } => {
            let codeplug = load_codeplug(&cli, codeplug.as_deref())?;
            let mut contacts = codeplug.contacts()?;
            if *assignments {
                // references are positions in storage order, resolve before sorting
                for (i, key) in codeplug.button_contacts(&contacts)?.into_iter().enumerate() {
                    println!("BUTTON,{},{}", i, key.map(|k| k.to_string()).unwrap_or_default());
                }
                for (i, key) in codeplug.channel_contacts(&contacts)?.into_iter().enumerate() {
                    println!("CHANNEL,{},{}", i, key.map(|k| k.to_string()).unwrap_or_default());
                }
            }
            contacts.sort(*sort);
            for (i, c) in contacts.iter().enumerate() {
                println!("{},{},{},{}", i + 1, c.call_sign, c.call_type, c.id);
            }
            log::info!("{} contacts", contacts.len());
        }
    }

    Ok(())
}

fn read_region(cli: &Cli, field: InfoField, path: &Path, trim: bool) -> Result<()> {
    let mut dfu = open_dfu(cli)?;
    let data = dfu.read_region(field, trim)?;
    dfu.reboot()?;
    write_file(path, &data)
}

fn write_region(cli: &Cli, field: InfoField, data: &[u8]) -> Result<()> {
    let mut dfu = open_dfu(cli)?;
    dfu.write_region(field, data)?;
    dfu.reboot()?;
    Ok(())
}

use clap::{Parser, ValueEnum};
use colored::Colorize;
use log::{info, warn};
use msc_bridge::{CommandBridge, MscCallback, SessionConfig};
use msc_core::MscEvent;
use msc_linux::{card_session, image_session, spawn_worker};
use rand::Rng;
use std::path::PathBuf;
use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use std::time::Duration;

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Wear-leveled flash partition kept in a disk image.
    Flash,
    /// SD card in RAM.
    Card,
}

#[derive(Parser)]
struct Cli {
    #[arg(long, value_enum, default_value = "flash")] backend: Backend,
    #[arg(long, default_value = "msc.img")] image: PathBuf,
    #[arg(long, default_value_t = 1024)] sectors: u32,
    #[arg(long, default_value_t = 512)] sector_size: u32,
    #[arg(long, default_value_t = 512)] buffer_size: usize,
    #[arg(long, default_value_t = 2)] max_files: i32,
    #[arg(long, default_value = "/data")] mount_path: String,
    /// Sectors the simulated host writes, at the end of the disk.
    #[arg(long, default_value_t = 16)] writes: u32,
    /// Stay attached until Ctrl-C.
    #[arg(long)] hold: bool,
}

fn logger(tag: &'static str) -> MscCallback {
    Box::new(move |ev: &MscEvent| info!("[{}] {:?} mounted={}", tag, ev.kind, ev.is_mounted))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    info!(">>> MSC DEVICE: v0.2.0 <<<");

    let config = SessionConfig {
        buffer_size: cli.buffer_size,
        max_files: cli.max_files,
        mount_path: cli.mount_path.clone(),
        on_premount_changed: Some(logger("PRE")),
        on_mount_changed: Some(logger("POST")),
        ..SessionConfig::default()
    };

    let session = match cli.backend {
        Backend::Flash => {
            info!("Flash image: {}", cli.image.display());
            image_session(&cli.image, cli.sectors as usize, cli.sector_size as usize, config)?
        }
        Backend::Card => card_session(cli.sectors, cli.sector_size, config)?,
    };
    let bridge = Arc::new(CommandBridge::new(session).map_err(|e| anyhow::anyhow!("bridge: {}", e))?);

    // Local application owns the volume until a host shows up.
    bridge.mount(None).map_err(|e| anyhow::anyhow!("mount: {}", e))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        warn!("Signal received. Stopping...");
        r.store(false, Ordering::SeqCst);
    })?;
    let stop = Arc::new(AtomicBool::new(true));
    let worker = spawn_worker(bridge.clone(), stop.clone());

    info!(">>> [USB] Host attached");
    bridge.on_attach();
    if !bridge.test_unit_ready(0) {
        anyhow::bail!("unit not ready, sense {:?}", bridge.sense());
    }

    let (count, size) = bridge.capacity(0);
    info!("Capacity: {} blocks x {} bytes", count, size);
    let writes = cli.writes.min(count);
    let first = count - writes;

    let mut rng = rand::thread_rng();
    let mut payloads = Vec::with_capacity(writes as usize);
    for i in 0..writes {
        let mut block = vec![0u8; size as usize];
        rng.fill(&mut block[..]);
        while bridge.write10(0, first + i, 0, &block) == 0 {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        payloads.push(block);
    }

    if cli.hold {
        info!("Holding the medium. Ctrl-C to detach.");
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    stop.store(false, Ordering::SeqCst);
    let committed = worker.join().map_err(|_| anyhow::anyhow!("write worker panicked"))?;

    let mut back = vec![0u8; size as usize];
    let mut bad = 0;
    for (i, block) in payloads.iter().enumerate() {
        if bridge.read10(0, first + i as u32, 0, &mut back) == 0 || back != *block {
            bad += 1;
        }
    }
    if bad == 0 {
        println!("{} {} blocks written and read back", "[PASS]".green(), committed);
    } else {
        println!("{} {} of {} blocks differ", "[FAIL]".red(), bad, payloads.len());
    }

    info!(">>> [USB] Host detached");
    bridge.on_detach();
    if let Ok(true) = bridge.is_mounted() {
        info!("Volume back at {}", cli.mount_path);
    }
    Ok(())
}

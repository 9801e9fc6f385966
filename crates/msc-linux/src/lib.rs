use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};

use msc_bridge::{CommandBridge, Session, SessionConfig};
use msc_core::MscError;
use msc_store::ImageFlash;

pub mod fat;
pub mod media;

pub use fat::{open_volume, BlockStream, FsKind, HostFat, Volume, VolumeInfo, PARTITION_START};
pub use media::{RamCard, RamFlash};

/// Idle sleep of the worker when no write is queued.
const IDLE: Duration = Duration::from_millis(1);

/// Run the deferred-write execution context on its own thread.
///
/// Polls `bridge` until `running` goes false, then drains what is left.
/// Returns the number of writes committed.
pub fn spawn_worker(bridge: Arc<CommandBridge>, running: Arc<AtomicBool>) -> JoinHandle<usize> {
    std::thread::spawn(move || {
        let mut committed = 0;
        while running.load(Ordering::SeqCst) {
            match bridge.poll() {
                Ok(n) => {
                    debug!("committed {} bytes", n);
                    committed += 1;
                }
                Err(nb::Error::WouldBlock) => std::thread::sleep(IDLE),
                Err(nb::Error::Other(e)) => warn!("deferred write failed: {}", e),
            }
        }
        committed += bridge.drain();
        info!("write worker stopped after {} writes", committed);
        committed
    })
}

/// Flash session over a disk image, with a `HostFat` driver.
pub fn image_session<P: AsRef<Path>>(
    path: P,
    sectors: usize,
    sector_size: usize,
    config: SessionConfig,
) -> anyhow::Result<Session> {
    let path = path.as_ref();
    let image = ImageFlash::open(path, sectors * sector_size, sector_size)
        .with_context(|| format!("opening image {}", path.display()))?;
    session_result(Session::flash(image, Box::new(HostFat::new(2)), config))
}

/// Card session over a `RamCard`, with a `HostFat` driver.
pub fn card_session(sectors: u32, sector_size: u32, config: SessionConfig) -> anyhow::Result<Session> {
    session_result(Session::card(
        RamCard::new(sectors, sector_size),
        Box::new(HostFat::new(2)),
        config,
    ))
}

fn session_result(r: Result<Session, MscError>) -> anyhow::Result<Session> {
    r.map_err(|e| anyhow::anyhow!("storage session: {}", e))
}

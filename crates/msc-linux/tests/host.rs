use msc_bridge::{CommandBridge, Session, SessionConfig};
use msc_core::{DriveSlot, FatType, FormatPolicy, MscError, FS_WORKBUF_SIZE};
use msc_hal::{BlockDisk, FatDriver, WearLevel};
use msc_linux::*;
use msc_store::{FlashBackend, StorageBackend};
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn serial_at(bridge: &CommandBridge, lba: u32) -> u32 {
    let mut boot = [0u8; 512];
    assert_eq!(bridge.read10(0, lba, 0, &mut boot), 512);
    assert_eq!(&boot[510..], &[0x55, 0xAA]);
    u32::from_le_bytes([boot[39], boot[40], boot[41], boot[42]])
}

#[test]
fn test_flash_programs_only_erased_cells() {
    let mut flash = RamFlash::new(4, 512);
    flash.write(0, &[0x0F; 16]).unwrap();
    assert_eq!(flash.write(0, &[0xF0; 16]), Err(MscError::MediaError));

    flash.erase_range(0, 512).unwrap();
    flash.write(0, &[0xF0; 16]).unwrap();
    assert_eq!(flash.erase_count(0), 1);
    assert_eq!(flash.erase_range(100, 512), Err(MscError::InvalidArg));
    assert_eq!(flash.erase_range(1024, 2048), Err(MscError::InvalidSize));
}

#[test]
fn test_backend_rewrites_sector_in_place() {
    let mut backend = FlashBackend::new(RamFlash::new(8, 512));
    backend.write(2, 0, &[0x12; 512]).unwrap();
    backend.write(2, 0, &[0x21; 512]).unwrap();

    let mut back = [0u8; 512];
    backend.read(2, 0, &mut back).unwrap();
    assert_eq!(back, [0x21; 512]);

    let flash = backend.into_inner();
    assert_eq!(flash.erase_count(2), 2);
    assert_eq!(flash.erase_count(3), 0);
}

#[test]
fn test_format_then_mount() {
    let mut fat = HostFat::new(1);
    let mut disk = FlashBackend::new(RamFlash::new(1024, 512));
    let slot = fat.acquire_slot().unwrap();
    let mut work = vec![0u8; FS_WORKBUF_SIZE];

    assert_eq!(fat.mount(slot, &mut disk), Err(MscError::NoFilesystem));
    fat.format(slot, &mut disk, &FormatPolicy::default(), &mut work).unwrap();
    fat.mount(slot, &mut disk).unwrap();

    let vol = fat.volume(slot).unwrap();
    assert_eq!(vol.kind, FsKind::Fat12);
    assert_eq!(vol.start, PARTITION_START);
    assert_eq!(vol.sectors, 1024 - PARTITION_START);
    assert_eq!(vol.cluster_size, 4096);

    fat.detach(slot);
    assert!(fat.volume(slot).is_none());
}

#[test]
fn test_single_partition_layout() {
    let mut fat = HostFat::new(1);
    let mut disk = FlashBackend::new(RamFlash::new(256, 512));
    let slot = fat.acquire_slot().unwrap();
    let policy = FormatPolicy { fat_type: FatType::Fat, single_partition: true };

    fat.format(slot, &mut disk, &policy, &mut vec![0u8; FS_WORKBUF_SIZE]).unwrap();
    fat.mount(slot, &mut disk).unwrap();
    let vol = fat.volume(slot).unwrap();
    assert_eq!((vol.kind, vol.start, vol.sectors), (FsKind::Fat12, 0, 256));

    let mut boot = [0u8; 512];
    disk.read(0, 0, &mut boot).unwrap();
    assert_eq!(&boot[54..62], b"FAT12   ");
}

#[test]
fn test_fat32_volume_opens() {
    let mut fat = HostFat::new(1);
    // 36 MB with 512-byte clusters is past the FAT32 cluster minimum.
    let mut disk = FlashBackend::new(RamFlash::new(72_000, 512));
    let slot = fat.acquire_slot().unwrap();
    let policy = FormatPolicy { fat_type: FatType::Fat32, single_partition: true };

    fat.format(slot, &mut disk, &policy, &mut [0u8; 512]).unwrap();
    fat.mount(slot, &mut disk).unwrap();
    let vol = fat.volume(slot).unwrap();
    assert_eq!(vol.kind, FsKind::Fat32);
    assert_eq!(vol.cluster_size, 512);
    assert!(vol.clusters >= 65525);

    // FSInfo at sector 1 and the backup boot sector at 6 are in place.
    let mut boot = [0u8; 512];
    let mut sector = [0u8; 512];
    disk.read(0, 0, &mut boot).unwrap();
    disk.read(1, 0, &mut sector).unwrap();
    assert_eq!(&sector[..4], b"RRaA");
    assert_eq!(&sector[510..], &[0x55, 0xAA]);
    disk.read(6, 0, &mut sector).unwrap();
    assert_eq!(sector, boot);

    let fs = open_volume(&mut disk).unwrap();
    let mut file = fs.root_dir().create_file("log.txt").unwrap();
    file.write_all(b"fat32 entry").unwrap();
    drop(file);
    fs.unmount().unwrap();

    let fs = open_volume(&mut disk).unwrap();
    let mut text = String::new();
    fs.root_dir().open_file("log.txt").unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "fat32 entry");
}

#[test]
fn test_file_survives_host_remount() {
    let session = Session::flash(RamFlash::new(1024, 512), Box::new(HostFat::new(2)), SessionConfig::default()).unwrap();
    let bridge = CommandBridge::new(session).unwrap();
    bridge.mount(None).unwrap();
    bridge.on_attach();
    let serial = serial_at(&bridge, PARTITION_START);

    // The host edits the volume with its own FAT code, sector by sector.
    let before = read_image(&bridge);
    let mut image = before.clone();
    {
        let part = &mut image[PARTITION_START as usize * 512..];
        let fs = fatfs::FileSystem::new(Cursor::new(part), fatfs::FsOptions::new()).unwrap();
        let mut file = fs.root_dir().create_file("host.txt").unwrap();
        file.write_all(b"written by the host").unwrap();
        drop(file);
        fs.unmount().unwrap();
    }
    for (lba, (old, new)) in before.chunks(512).zip(image.chunks(512)).enumerate() {
        if old != new {
            assert_eq!(bridge.write10(0, lba as u32, 0, new), 512);
            assert_eq!(bridge.drain(), 1);
        }
    }

    // Local mount keeps the volume rather than formatting it.
    bridge.on_detach();
    assert_eq!(bridge.is_mounted(), Ok(true));
    bridge.on_attach();
    assert_eq!(serial_at(&bridge, PARTITION_START), serial);

    let mut image = read_image(&bridge);
    let part = &mut image[PARTITION_START as usize * 512..];
    let fs = fatfs::FileSystem::new(Cursor::new(part), fatfs::FsOptions::new()).unwrap();
    let mut text = String::new();
    fs.root_dir().open_file("host.txt").unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "written by the host");
}

fn read_image(bridge: &CommandBridge) -> Vec<u8> {
    let (count, size) = bridge.capacity(0);
    let size = size as usize;
    let mut image = vec![0u8; count as usize * size];
    for (lba, sector) in image.chunks_mut(size).enumerate() {
        assert_eq!(bridge.read10(0, lba as u32, 0, sector), size);
    }
    image
}

/// Whole-disk FAT32 boot sector with a FAT of 0xFFFFFFFF sectors.
fn oversized_fat_boot() -> [u8; 512] {
    let mut boot = [0u8; 512];
    boot[0] = 0xEB;
    boot[11..13].copy_from_slice(&512u16.to_le_bytes());
    boot[13] = 1;
    boot[14..16].copy_from_slice(&1u16.to_le_bytes());
    boot[16] = 2;
    boot[32..36].copy_from_slice(&1024u32.to_le_bytes());
    boot[36..40].copy_from_slice(&u32::MAX.to_le_bytes());
    boot[510] = 0x55;
    boot[511] = 0xAA;
    boot
}

#[test]
fn test_garbage_boot_sector_rejected() {
    let mut fat = HostFat::new(1);
    let mut disk = FlashBackend::new(RamFlash::new(1024, 512));
    let slot = fat.acquire_slot().unwrap();

    let mut variants = vec![oversized_fat_boot()];
    let mut boot = oversized_fat_boot();
    boot[36..40].copy_from_slice(&8u32.to_le_bytes());
    boot[11..13].copy_from_slice(&4096u16.to_le_bytes());
    variants.push(boot);
    let mut boot = oversized_fat_boot();
    boot[36..40].copy_from_slice(&8u32.to_le_bytes());
    boot[16] = 0;
    variants.push(boot);
    let mut boot = oversized_fat_boot();
    boot[36..40].copy_from_slice(&8u32.to_le_bytes());
    boot[32..36].copy_from_slice(&u32::MAX.to_le_bytes());
    variants.push(boot);

    for boot in &variants {
        disk.write(0, 0, boot).unwrap();
        assert_eq!(fat.mount(slot, &mut disk), Err(MscError::NoFilesystem));
        assert!(fat.volume(slot).is_none());
    }
}

#[test]
fn test_host_written_garbage_reformats() {
    let session = Session::flash(RamFlash::new(1024, 512), Box::new(HostFat::new(2)), SessionConfig::default()).unwrap();
    let bridge = CommandBridge::new(session).unwrap();
    bridge.mount(None).unwrap();
    bridge.on_attach();

    assert_eq!(bridge.write10(0, 0, 0, &oversized_fat_boot()), 512);
    assert_eq!(bridge.drain(), 1);
    bridge.on_detach();
    assert_eq!(bridge.is_mounted(), Ok(true));

    bridge.on_attach();
    serial_at(&bridge, PARTITION_START);
}

#[test]
fn test_format_policy_limits() {
    let mut fat = HostFat::new(1);
    let mut disk = FlashBackend::new(RamFlash::new(256, 512));
    let slot = fat.acquire_slot().unwrap();
    let mut work = vec![0u8; FS_WORKBUF_SIZE];

    let exfat = FormatPolicy { fat_type: FatType::ExFat, single_partition: true };
    assert_eq!(fat.format(slot, &mut disk, &exfat, &mut work), Err(MscError::NotSupported));

    // 256 sectors cannot hold a FAT32 volume.
    let fat32 = FormatPolicy { fat_type: FatType::Fat32, single_partition: true };
    assert_eq!(fat.format(slot, &mut disk, &fat32, &mut work), Err(MscError::FsFailure));

    // Nothing was written.
    assert_eq!(fat.mount(slot, &mut disk), Err(MscError::NoFilesystem));
}

#[test]
fn test_driver_slots_and_paths() {
    let mut fat = HostFat::new(1);
    let slot = fat.acquire_slot().unwrap();
    assert_eq!(fat.acquire_slot(), Err(MscError::ResourceExhausted));

    fat.register("/data", slot, 4).unwrap();
    assert_eq!(fat.register("/data", slot, 4), Err(MscError::AlreadyRegistered));
    assert_eq!(fat.max_files("/data"), Some(4));

    // Unacquired drive.
    assert_eq!(fat.register("/other", DriveSlot(1), 4), Err(MscError::InvalidState));

    fat.unregister("/data").unwrap();
    assert_eq!(fat.unregister("/data"), Err(MscError::InvalidState));
    fat.release_slot(slot);
    assert_eq!(fat.slots_in_use(), 0);
}

#[test]
fn test_bridge_over_host_driver() {
    let session = Session::flash(RamFlash::new(1024, 512), Box::new(HostFat::new(2)), SessionConfig::default()).unwrap();
    let bridge = CommandBridge::new(session).unwrap();

    bridge.mount(None).unwrap();
    bridge.on_attach();
    let serial = serial_at(&bridge, PARTITION_START);

    // Existing volume survives a round trip through the FAT driver.
    bridge.on_detach();
    bridge.on_attach();
    assert_eq!(serial_at(&bridge, PARTITION_START), serial);

    // Host wipes the partition table: next mount formats again.
    assert_eq!(bridge.write10(0, 0, 0, &[0u8; 512]), 512);
    assert_eq!(bridge.drain(), 1);
    bridge.on_detach();
    assert_eq!(bridge.is_mounted(), Ok(true));
    bridge.on_attach();
    serial_at(&bridge, PARTITION_START);
}

#[test]
fn test_worker_commits_host_writes() {
    let session = Session::flash(RamFlash::new(64, 512), Box::new(HostFat::new(1)), SessionConfig::default()).unwrap();
    let bridge = Arc::new(CommandBridge::new(session).unwrap());
    let running = Arc::new(AtomicBool::new(true));
    let worker = spawn_worker(bridge.clone(), running.clone());

    for lba in 0..8u32 {
        while bridge.write10(0, lba, 0, &[lba as u8; 512]) == 0 {
            std::thread::yield_now();
        }
    }
    running.store(false, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap(), 8);

    let mut back = [0u8; 512];
    bridge.read10(0, 7, 0, &mut back);
    assert_eq!(back, [7u8; 512]);
}

#[test]
fn test_card_session_formats() {
    let session = card_session(2048, 512, SessionConfig::default()).unwrap();
    let bridge = CommandBridge::new(session).unwrap();
    assert_eq!(bridge.capacity(0), (2048, 512));

    bridge.mount(None).unwrap();
    bridge.on_attach();
    serial_at(&bridge, PARTITION_START);
}

#[test]
fn test_image_session_keeps_volume() {
    let path = "./test_linux_image";
    let _ = std::fs::remove_file(path);

    let session = image_session(path, 512, 512, SessionConfig::default()).unwrap();
    let bridge = CommandBridge::new(session).unwrap();
    bridge.mount(None).unwrap();
    bridge.on_attach();
    let serial = serial_at(&bridge, PARTITION_START);
    let (backend, _) = bridge.deinit().unwrap().deinit();
    assert!(backend.drive().is_none());
    drop(backend);

    let session = image_session(path, 512, 512, SessionConfig::default()).unwrap();
    let bridge = CommandBridge::new(session).unwrap();
    bridge.mount(None).unwrap();
    bridge.on_attach();
    assert_eq!(serial_at(&bridge, PARTITION_START), serial);

    std::fs::remove_file(path).unwrap();
}

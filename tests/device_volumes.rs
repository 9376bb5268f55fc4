mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use noxcipher_format::consts::{VOLUME_DATA_OFFSET, VOLUME_HEADER_GROUP_SIZE};
use noxcipher_format::{FormatError, FormatHooks, FormatRequest, FormatSession, SessionConfig, Status, VolumeFormatter};

fn device_request(size: u64, sector_size: u32, quick: bool) -> FormatRequest {
    let mut req = FormatRequest::device("/dev/mem0", size, password("device"));
    req.pim = 1;
    req.sector_size = sector_size;
    req.quick_format = quick;
    req
}

fn format_on(provider: MemProvider, req: &FormatRequest) -> noxcipher_format::Result<noxcipher_format::FormatReport> {
    let hooks = FormatHooks { devices: Box::new(provider), ..Default::default() };
    VolumeFormatter::new(FormatSession::new(SessionConfig::default()).unwrap(), hooks).format(req)
}

#[test]
fn full_format_through_write_pipeline() {
    let size = 8 * MIB;
    let device = MemDevice::with_size(size);
    let provider = MemProvider::new(device.clone());
    let released = provider.released.clone();
    let req = device_request(size, 4096, false);

    let report = format_on(provider, &req).unwrap();
    assert_eq!(report.fill_passes, 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);

    let image = device.snapshot();
    assert_eq!(image.len() as u64, size);
    let data_area = size - 256 * 1024;
    let (primary, _) = decode_at(&image, 0, &req.password).unwrap();
    assert_eq!(primary.sector_size, 4096);
    let (backup, _) = decode_at(&image, data_area + VOLUME_HEADER_GROUP_SIZE, &req.password).unwrap();
    assert_eq!(primary.master_key_data, backup.master_key_data);

    let data = &image[VOLUME_DATA_OFFSET as usize..(VOLUME_DATA_OFFSET + data_area) as usize];
    assert!(data.chunks(4096).all(|s| s.iter().any(|&b| b != 0)));
}

#[test]
fn quick_format_only_writes_headers() {
    let size = 16 * MIB;
    let device = MemDevice::with_size(size);
    let written = device.written.clone();
    let req = device_request(size, 512, true);

    format_on(MemProvider::new(device.clone()), &req).unwrap();
    // Primary, backup and two decoy headers plus both reserved header groups.
    assert_eq!(written.load(Ordering::SeqCst), 4 * 512 + 2 * VOLUME_HEADER_GROUP_SIZE);

    let image = device.snapshot();
    let data = &image[VOLUME_DATA_OFFSET as usize..(size - VOLUME_HEADER_GROUP_SIZE) as usize];
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn shared_access_needs_approval() {
    let size = 4 * MIB;
    let device = MemDevice::with_size(size);
    let written = device.written.clone();
    let mut provider = MemProvider::new(device.clone());
    provider.shared_access = true;
    let released = provider.released.clone();

    let req = device_request(size, 512, true);
    let err = format_on(provider, &req).unwrap_err();
    assert!(matches!(err, FormatError::DontReport(_)));
    assert_eq!(written.load(Ordering::SeqCst), 0);
    assert_eq!(released.load(Ordering::SeqCst), 1);

    let mut forced = device_request(size, 512, true);
    forced.force = true;
    let mut provider = MemProvider::new(device);
    provider.shared_access = true;
    assert!(format_on(provider, &forced).is_ok());
}

#[test]
fn approved_shared_access_proceeds() {
    let size = 4 * MIB;
    let mut provider = MemProvider::new(MemDevice::with_size(size));
    provider.shared_access = true;
    let hooks = FormatHooks {
        devices: Box::new(provider),
        prompts: Box::new(ScriptedPrompts { allow_shared: true, ..Default::default() }),
        ..Default::default()
    };
    let req = device_request(size, 512, true);
    let mut formatter = VolumeFormatter::new(FormatSession::default(), hooks);
    assert!(formatter.format(&req).is_ok());
}

#[test]
fn seek_that_lands_elsewhere_is_an_io_error() {
    let size = 4 * MIB;
    let mut device = MemDevice::with_size(size);
    device.seek_skew = 1;
    let req = device_request(size, 512, true);

    let err = format_on(MemProvider::new(device), &req).unwrap_err();
    assert!(is_os_error(&err));
    assert_eq!(err.status(), Status::OsError);
}

#[test]
fn pipeline_write_failure_is_returned() {
    let size = 8 * MIB;
    let mut device = MemDevice::with_size(size);
    device.fail_after = Some(MIB);
    let req = device_request(size, 512, false);

    let err = format_on(MemProvider::new(device), &req).unwrap_err();
    assert!(is_os_error(&err));
}

#[test]
fn cancelled_fill_returns_user_abort() {
    let size = 16 * MIB;
    let mut device = MemDevice::with_size(size);
    device.write_delay = Some(Duration::from_millis(10));
    let reports = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let seen = reports.clone();

    let hooks = FormatHooks {
        devices: Box::new(MemProvider::new(device)),
        progress: Box::new(move |_bytes: u64| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        }),
        ..Default::default()
    };
    let req = device_request(size, 512, false);
    let err = VolumeFormatter::new(FormatSession::default(), hooks).format(&req).unwrap_err();
    assert!(matches!(err, FormatError::UserAbort));
    assert_eq!(err.status(), Status::UserAbort);
    assert_eq!(reports.load(Ordering::SeqCst), 1);
}

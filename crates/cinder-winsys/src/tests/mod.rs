//! End-to-end tests against the in-memory kernel

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cinder_cmd::Submission;
use cinder_core::{
    BoFlags, ContextId, DeviceKey, Domain, Error, FenceId, GemCreateInfo, GpuAddr, HandleKind,
    KernelInterface, MapFlags, QueueKind, RawFd, WinsysConfig, WinsysHandle,
};
use cinder_mem::Bo;
use cinder_test_framework::StubKernel;

use crate::{DeviceRegistry, FrontEnd};

const PATH: &str = "/dev/dri/renderD128";
const MIB: u64 = 1024 * 1024;

fn setup() -> (Arc<StubKernel>, DeviceRegistry) {
    let stub = Arc::new(StubKernel::new());
    let registry = DeviceRegistry::new(stub.clone(), WinsysConfig::default());
    (stub, registry)
}

fn create(fe: &FrontEnd, size: u64) -> Bo {
    fe.buffer_create(size, 4096, Domain::Vram, BoFlags::empty())
        .unwrap()
}

fn kms(handle: WinsysHandle) -> cinder_core::KmsHandle {
    match handle {
        WinsysHandle::Kms(handle) => handle,
        other => panic!("expected a KMS handle, got {:?}", other),
    }
}

/// Buffer created by someone else, exported as a dma-buf
fn foreign_dmabuf(stub: &StubKernel) -> (RawFd, cinder_core::DmaBufFd) {
    let other = stub.open("/dev/dri/renderD129");
    let info = GemCreateInfo {
        size: MIB,
        alignment: 4096,
        domain: Domain::Gtt,
        flags: BoFlags::empty(),
    };
    let (handle, _) = stub.gem_create(other, &info).unwrap();
    (other, stub.prime_export(other, handle).unwrap())
}

#[test]
fn test_descriptions_get_distinct_handles() {
    let (stub, registry) = setup();
    let a = stub.open(PATH);
    let b = stub.open(PATH);
    let fe_a = registry.open(a).unwrap();
    let fe_b = registry.open(b).unwrap();
    assert!(Arc::ptr_eq(fe_a.device(), fe_b.device()));
    assert!(fe_a.is_native());
    assert!(!fe_b.is_native());

    let bo = create(&fe_a, MIB);
    let ha = kms(fe_a.buffer_get_handle(&bo, HandleKind::Kms).unwrap());
    let hb = kms(fe_b.buffer_get_handle(&bo, HandleKind::Kms).unwrap());

    assert_ne!(ha, hb);
    let identity = bo.identity();
    assert_eq!(stub.resolve(fe_a.fd(), ha), identity);
    assert_eq!(stub.resolve(fe_b.fd(), hb), identity);
    assert_eq!(stub.counters().gem_creates, 1);

    // Cached per front-end
    let again = kms(fe_b.buffer_get_handle(&bo, HandleKind::Kms).unwrap());
    assert_eq!(again, hb);
    assert_eq!(fe_b.imported_handle_count(), 1);
}

#[test]
fn test_duplicated_descriptor_reuses_native_handle() {
    let (stub, registry) = setup();
    let a = stub.open(PATH);
    let dup = stub.dup_fd(a).unwrap();
    let fe = registry.open(a).unwrap();
    let fe_dup = registry.open(dup).unwrap();
    assert!(Arc::ptr_eq(&fe, &fe_dup));

    let bo = create(&fe, MIB);
    let handle = kms(fe_dup.buffer_get_handle(&bo, HandleKind::Kms).unwrap());
    assert_eq!(Some(handle), bo.kms_handle());
    assert_eq!(stub.counters().prime_exports, 0);
    assert_eq!(fe.device().frontend_count(), 1);
}

#[test]
fn test_concurrent_import_yields_one_buffer() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let (_other, dmabuf) = foreign_dmabuf(&stub);

    let imports: Vec<Bo> = (0..2)
        .map(|_| {
            let fe = fe.clone();
            thread::spawn(move || fe.buffer_from_handle(WinsysHandle::Fd(dmabuf)).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();

    assert!(Bo::ptr_eq(&imports[0], &imports[1]));
    assert_eq!(imports[0].refcount(), 2);
    assert!(imports[0].is_shared());
    assert!(imports[0].is_imported());
    assert_eq!(fe.device().shared_buffer_count(), 1);
}

#[test]
fn test_failed_import_inserts_nothing() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let (_other, dmabuf) = foreign_dmabuf(&stub);
    stub.fail_next_imports(1);

    assert_eq!(
        fe.buffer_from_handle(WinsysHandle::Fd(dmabuf)).err(),
        Some(Error::ImportFailed)
    );
    assert_eq!(fe.device().shared_buffer_count(), 0);
    assert!(fe.buffer_from_handle(WinsysHandle::Fd(dmabuf)).is_ok());
}

#[test]
fn test_exported_buffer_imports_as_itself() {
    let (stub, registry) = setup();
    let fe_a = registry.open(stub.open(PATH)).unwrap();
    let fe_b = registry.open(stub.open(PATH)).unwrap();
    let bo = create(&fe_a, MIB);

    let hb = fe_b.buffer_get_handle(&bo, HandleKind::Kms).unwrap();
    let back = fe_b.buffer_from_handle(hb).unwrap();
    assert!(Bo::ptr_eq(&bo, &back));
    assert_eq!(bo.refcount(), 2);

    let WinsysHandle::Fd(dmabuf) = fe_a.buffer_get_handle(&bo, HandleKind::Fd).unwrap() else {
        panic!("expected a dma-buf");
    };
    let from_fd = fe_a.buffer_from_handle(WinsysHandle::Fd(dmabuf)).unwrap();
    assert!(Bo::ptr_eq(&bo, &from_fd));
    stub.close_fd(dmabuf.0);
}

#[test]
fn test_shared_buffer_destroy_closes_every_handle() {
    let (stub, registry) = setup();
    let fe_a = registry.open(stub.open(PATH)).unwrap();
    let fe_b = registry.open(stub.open(PATH)).unwrap();
    let bo = create(&fe_a, MIB);
    let hb = kms(fe_b.buffer_get_handle(&bo, HandleKind::Kms).unwrap());
    let ha = bo.kms_handle().unwrap();

    drop(bo);
    assert!(!stub.handle_valid(fe_b.fd(), hb));
    assert!(!stub.handle_valid(fe_a.device().fd(), ha));
    assert_eq!(fe_b.imported_handle_count(), 0);
    assert_eq!(fe_a.device().shared_buffer_count(), 0);
    assert_eq!(stub.live_objects(), 0);
}

#[test]
fn test_revived_shared_buffer_is_destroyed_once() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let device = fe.device().clone();
    let bo = create(&fe, MIB);
    fe.buffer_get_handle(&bo, HandleKind::Kms).unwrap();
    let inner = bo.inner().clone();
    let va_frees = stub.counters().va_frees;

    // Both releases queue up behind an import holding the table
    let table = device.exports().lock();
    let first = thread::spawn(move || drop(bo));
    while inner.refcount() != 0 {
        thread::yield_now();
    }
    let revived = Bo::acquire(&inner);
    let second = thread::spawn(move || drop(revived));
    while inner.refcount() != 0 {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(20));
    drop(table);
    first.join().unwrap();
    second.join().unwrap();

    assert_eq!(stub.counters().va_frees, va_frees + 1);
    assert_eq!(device.stats().allocated_in(Domain::Vram), 0);
    assert_eq!(device.shared_buffer_count(), 0);
    assert_eq!(stub.live_objects(), 0);
}

#[test]
fn test_sharing_errors_keep_device_lost() {
    let (stub, registry) = setup();
    let fe_a = registry.open(stub.open(PATH)).unwrap();
    let fe_b = registry.open(stub.open(PATH)).unwrap();
    let device = fe_a.device().clone();
    let bo = create(&fe_a, MIB);

    stub.fail_prime(Some(Error::Kernel(-5)));
    assert_eq!(
        fe_b.buffer_get_handle(&bo, HandleKind::Kms).err(),
        Some(Error::ExportFailed)
    );
    assert!(!device.is_lost());

    stub.fail_prime(None);
    let (_other, dmabuf) = foreign_dmabuf(&stub);
    stub.fail_prime(Some(Error::DeviceLost));
    assert_eq!(
        fe_a.buffer_from_handle(WinsysHandle::Fd(dmabuf)).err(),
        Some(Error::DeviceLost)
    );
    assert!(device.is_lost());
    stub.fail_prime(None);
    assert_eq!(
        fe_b.buffer_get_handle(&bo, HandleKind::Kms).err(),
        Some(Error::DeviceLost)
    );
}

#[test]
fn test_vm_update_on_lost_device_is_sticky() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let device = fe.device().clone();
    let bo = create(&fe, MIB);
    stub.inject_device_lost();

    let va = GpuAddr::new(0x7000_0000_0000);
    assert_eq!(device.vm_map(&bo, va), Err(Error::DeviceLost));
    assert!(device.is_lost());
    assert_eq!(
        fe.buffer_create(MIB, 4096, Domain::Gtt, BoFlags::empty()).err(),
        Some(Error::DeviceLost)
    );
}

#[test]
fn test_full_ring_waits_through_device() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let device = fe.device().clone();
    let bo = create(&fe, MIB);

    for _ in 0..40 {
        let mut cs = Submission::new(QueueKind::Gfx, ContextId(1));
        cs.add_buffer(&bo);
        device.submit_sync(cs).unwrap();
    }
    let fences: Vec<FenceId> = stub.submissions().iter().map(|s| s.fence).collect();
    assert_eq!(fences.len(), 40);
    // Submissions 33..=40 each waited for the one 32 earlier
    assert_eq!(stub.wait_log(), fences[..8].to_vec());
    assert_eq!(device.stats().ring_eviction_waits, 8);

    assert!(device.buffer_is_busy(&bo).unwrap());
    assert!(device.buffer_wait(&bo, u64::MAX).unwrap());
    assert_eq!(stub.wait_log().last(), Some(&fences[39]));
    assert!(!device.buffer_is_busy(&bo).unwrap());
}

#[test]
fn test_slab_entries_cannot_be_shared() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let small = create(&fe, 4096);
    assert!(small.is_slab());
    assert_eq!(
        fe.buffer_get_handle(&small, HandleKind::Fd).err(),
        Some(Error::InvalidParameter)
    );
}

#[test]
fn test_registry_one_device_per_path() {
    let (stub, registry) = setup();
    let a = stub.open(PATH);
    let b = stub.open(PATH);
    let c = stub.open("/dev/dri/renderD129");
    let fds_before = stub.open_fd_count();

    let fe_a = registry.open(a).unwrap();
    let fe_b = registry.open(b).unwrap();
    let fe_c = registry.open(c).unwrap();
    assert_eq!(registry.device_count(), 2);
    assert!(!Arc::ptr_eq(fe_a.device(), fe_c.device()));

    let bo = create(&fe_a, MIB);
    let small = create(&fe_a, 4096);
    drop((bo, small));

    drop(fe_a);
    assert_eq!(registry.device_count(), 2);
    drop(fe_b);
    assert_eq!(registry.device_count(), 1);
    assert!(registry.device(&DeviceKey(PATH.into())).is_none());
    drop(fe_c);
    assert_eq!(registry.device_count(), 0);

    assert_eq!(stub.open_fd_count(), fds_before);
    assert_eq!(stub.live_objects(), 0);
    assert_eq!(stub.live_syncobjs(), 0);
}

#[test]
fn test_device_lost_is_sticky() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let device = fe.device().clone();
    let bo = create(&fe, MIB);
    stub.inject_device_lost();

    let mut cs = Submission::new(QueueKind::Gfx, ContextId(1));
    cs.add_buffer(&bo);
    let ticket = device.submit(cs).unwrap();
    assert_eq!(ticket.wait(), Err(Error::DeviceLost));

    assert!(device.is_lost());
    assert_eq!(
        fe.buffer_create(MIB, 4096, Domain::Vram, BoFlags::empty()).err(),
        Some(Error::DeviceLost)
    );
    assert_eq!(
        device
            .submit(Submission::new(QueueKind::Gfx, ContextId(1)))
            .err(),
        Some(Error::DeviceLost)
    );
    assert_eq!(device.buffer_map(&bo, MapFlags::READ), Err(Error::DeviceLost));
}

#[test]
fn test_map_flushes_queued_work() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let device = fe.device().clone();
    let bo = create(&fe, MIB);

    let mut cs = Submission::new(QueueKind::Gfx, ContextId(1));
    cs.add_buffer(&bo);
    let _ticket = device.submit(cs).unwrap();

    device.buffer_map(&bo, MapFlags::WRITE).unwrap();
    assert_eq!(stub.counters().submits, 1);
    assert_eq!(bo.pending_submissions(), 0);
    assert!(!device.buffer_is_busy(&bo).unwrap());
    assert_eq!(device.stats().num_mapped_buffers, 1);
    device.buffer_unmap(&bo);
}

#[test]
fn test_buffer_wait_reports_idle() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let device = fe.device().clone();
    let bo = create(&fe, MIB);

    let mut cs = Submission::new(QueueKind::Compute, ContextId(1));
    cs.add_buffer(&bo);
    device.submit_sync(cs).unwrap();
    assert!(device.buffer_is_busy(&bo).unwrap());
    assert!(device.buffer_wait(&bo, u64::MAX).unwrap());
    assert!(!device.buffer_is_busy(&bo).unwrap());
}

#[test]
fn test_vm_map_advances_timeline() {
    let (stub, registry) = setup();
    let fe = registry.open(stub.open(PATH)).unwrap();
    let device = fe.device().clone();
    let bo = create(&fe, MIB);
    let start = device.vm_timeline_point();

    let va = GpuAddr::new(0x7000_0000_0000);
    assert_eq!(device.vm_map(&bo, va).unwrap(), start + 1);
    assert_eq!(device.vm_unmap(&bo, va).unwrap(), start + 2);
    assert_eq!(device.vm_timeline_point(), start + 2);

    let small = create(&fe, 4096);
    assert_eq!(device.vm_map(&small, va).err(), Some(Error::InvalidParameter));
}

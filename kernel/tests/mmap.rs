mod common;

use std::sync::Arc;

use common::{data_page, is_resident, Machine};
use vm_core::process::file::{BackingFile, MemFile};
use vm_core::{PageTarget, VmError, VmType, PAGE_SIZE};
use x86_64::VirtAddr;

fn file(contents: &[u8]) -> (Arc<MemFile>, Arc<dyn BackingFile>) {
    let file = Arc::new(MemFile::new("mapped", contents));
    let handle: Arc<dyn BackingFile> = file.clone();
    (file, handle)
}

#[test]
fn written_bytes_reach_the_file_on_munmap() {
    let machine = Machine::new(4, 4);
    let mut user = machine.user();
    let (file, handle) = file(&[0u8; 3 * PAGE_SIZE]);
    let base = data_page(0);
    let len = 3 * PAGE_SIZE;

    let addr = user
        .aspace
        .mmap(&machine.vm, VirtAddr::new(base), len, true, &handle, 0)
        .unwrap();
    assert_eq!(addr.as_u64(), base);

    let message = b"hello from user space, spanning a page boundary";
    let at = base + PAGE_SIZE as u64 - 10;
    machine.write(&mut user, at, message).unwrap();
    assert!(file.contents().iter().all(|&b| b == 0));

    user.aspace.munmap(&machine.vm, addr).unwrap();

    let off = PAGE_SIZE - 10;
    assert_eq!(&file.contents()[off..off + message.len()], message);
    for i in 0..len as u64 {
        assert!(user.aspace.find(VirtAddr::new(base + i)).is_none());
    }
    assert!(user.aspace.mmaps().is_empty());
    assert_eq!(machine.vm.resident_frames(), 0);
}

#[test]
fn short_file_is_zero_filled() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    let (_, handle) = file(&[0x42u8; 4000]);
    let base = data_page(4);

    user.aspace
        .mmap(&machine.vm, VirtAddr::new(base), PAGE_SIZE, false, &handle, 0)
        .unwrap();

    let page = user.aspace.find(VirtAddr::new(base)).unwrap();
    {
        let page = page.lock();
        let segment = page.segment().unwrap();
        assert_eq!(segment.read_bytes, 4000);
        assert_eq!(segment.zero_bytes, PAGE_SIZE - 4000);
        assert_eq!(page.target_type(), VmType::File);
    }

    let bytes = machine.read(&mut user, base, PAGE_SIZE).unwrap();
    assert!(bytes[..4000].iter().all(|&b| b == 0x42));
    assert!(bytes[4000..].iter().all(|&b| b == 0));
}

#[test]
fn pages_past_eof_are_file_pages_with_nothing_to_read() {
    let machine = Machine::new(4, 4);
    let mut user = machine.user();
    let (_, handle) = file(&[1u8; 100]);
    let base = data_page(0);

    user.aspace
        .mmap(&machine.vm, VirtAddr::new(base), 2 * PAGE_SIZE, true, &handle, 0)
        .unwrap();

    let tail = user
        .aspace
        .find(VirtAddr::new(base + PAGE_SIZE as u64))
        .unwrap();
    assert_eq!(tail.lock().target_type(), VmType::File);
    assert_eq!(tail.lock().segment().map(|s| s.read_bytes), Some(0));
    assert_eq!(
        machine.read(&mut user, base + PAGE_SIZE as u64, 8).unwrap(),
        [0u8; 8]
    );
}

#[test]
fn mapping_survives_closing_the_callers_handle() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    let (file, handle) = file(b"persistent");
    let base = data_page(0);

    user.aspace
        .mmap(&machine.vm, VirtAddr::new(base), 10, true, &handle, 0)
        .unwrap();
    drop(handle);

    assert_eq!(machine.read(&mut user, base, 10).unwrap(), b"persistent");
    machine.write(&mut user, base, b"P").unwrap();
    user.aspace.munmap(&machine.vm, VirtAddr::new(base)).unwrap();
    assert_eq!(file.contents(), b"Persistent");
}

#[test]
fn offset_selects_the_file_window() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    let mut contents = vec![0xAAu8; PAGE_SIZE];
    contents.extend_from_slice(&[0xBB; 16]);
    let (_, handle) = file(&contents);
    let base = data_page(2);

    user.aspace
        .mmap(
            &machine.vm,
            VirtAddr::new(base),
            PAGE_SIZE,
            false,
            &handle,
            PAGE_SIZE as u64,
        )
        .unwrap();
    let bytes = machine.read(&mut user, base, 32).unwrap();
    assert_eq!(&bytes[..16], &[0xBB; 16]);
    assert_eq!(&bytes[16..], &[0; 16]);
}

#[test]
fn bad_arguments_are_rejected() {
    let machine = Machine::new(1, 1);
    let mut user = machine.user();
    let vm = &machine.vm;
    let (_, handle) = file(&[1u8; 64]);
    let (_, empty) = file(&[]);
    let base = VirtAddr::new(data_page(0));

    let cases = [
        (VirtAddr::new(0), 64, &handle, 0, VmError::NullAddress),
        (base + 1u64, 64, &handle, 0, VmError::Misaligned),
        (base, 64, &handle, 100, VmError::Misaligned),
        (base, 0, &handle, 0, VmError::InvalidLength),
        (base, 64, &empty, 0, VmError::InvalidLength),
        (
            VirtAddr::new(0x0000_7fff_ffff_f000),
            2 * PAGE_SIZE,
            &handle,
            0,
            VmError::KernelAddress,
        ),
    ];
    for (addr, len, file, offset, expected) in cases {
        let result = user.aspace.mmap(vm, addr, len, true, file, offset);
        assert_eq!(result, Err(expected), "{:?} len {}", addr, len);
    }
    assert!(user.aspace.spt().is_empty());
    assert!(user.aspace.mmaps().is_empty());
}

#[test]
fn overlapping_mapping_is_rolled_back() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    let (_, handle) = file(&[5u8; 4 * PAGE_SIZE]);
    let base = data_page(8);

    // Something already lives at page 10.
    user.aspace
        .alloc_lazy(
            &machine.vm,
            PageTarget::Anon,
            VirtAddr::new(data_page(10)),
            true,
            None,
        )
        .unwrap();

    let result = user.aspace.mmap(
        &machine.vm,
        VirtAddr::new(base),
        4 * PAGE_SIZE,
        true,
        &handle,
        0,
    );
    assert_eq!(result, Err(VmError::AlreadyMapped));

    // Pages 8 and 9 were created before the clash and are gone again.
    assert!(user.aspace.find(VirtAddr::new(data_page(8))).is_none());
    assert!(user.aspace.find(VirtAddr::new(data_page(9))).is_none());
    assert!(user.aspace.find(VirtAddr::new(data_page(11))).is_none());
    let survivor = user.aspace.find(VirtAddr::new(data_page(10))).unwrap();
    assert_eq!(survivor.lock().target_type(), VmType::Anon);
    assert_eq!(user.aspace.spt().len(), 1);
    assert!(user.aspace.mmaps().is_empty());
}

#[test]
fn munmap_stops_at_the_recorded_extent() {
    let machine = Machine::new(4, 4);
    let mut user = machine.user();
    let (first, first_handle) = file(&[0u8; PAGE_SIZE]);
    let (second, second_handle) = file(&[0u8; PAGE_SIZE]);
    let vm = &machine.vm;

    // Two mappings back to back.
    let a = VirtAddr::new(data_page(0));
    let b = VirtAddr::new(data_page(1));
    user.aspace.mmap(vm, a, PAGE_SIZE, true, &first_handle, 0).unwrap();
    user.aspace.mmap(vm, b, PAGE_SIZE, true, &second_handle, 0).unwrap();
    machine.write(&mut user, a.as_u64(), b"A").unwrap();
    machine.write(&mut user, b.as_u64(), b"B").unwrap();

    user.aspace.munmap(vm, a).unwrap();
    assert!(user.aspace.find(a).is_none());
    assert!(is_resident(&user, b.as_u64()));
    assert_eq!(first.contents()[0], b'A');
    assert_eq!(second.contents()[0], 0);

    assert_eq!(user.aspace.mmaps().len(), 1);
    user.aspace.munmap(vm, b).unwrap();
    assert_eq!(second.contents()[0], b'B');
}

#[test]
fn munmap_needs_the_start_address() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    let (_, handle) = file(&[0u8; 2 * PAGE_SIZE]);
    let base = VirtAddr::new(data_page(0));

    user.aspace
        .mmap(&machine.vm, base, 2 * PAGE_SIZE, true, &handle, 0)
        .unwrap();
    assert_eq!(
        user.aspace.munmap(&machine.vm, base + PAGE_SIZE as u64),
        Err(VmError::NotMapped)
    );
    assert_eq!(user.aspace.spt().len(), 2);

    user.aspace.munmap(&machine.vm, base).unwrap();
    assert_eq!(
        user.aspace.munmap(&machine.vm, base),
        Err(VmError::NotMapped)
    );
}

#[test]
fn read_only_mapping_rejects_writes() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    let (file, handle) = file(&[3u8; 64]);
    let base = data_page(0);

    user.aspace
        .mmap(&machine.vm, VirtAddr::new(base), 64, false, &handle, 0)
        .unwrap();

    // Not present yet: the write is refused before anything is loaded.
    assert_eq!(
        machine.write(&mut user, base, b"x"),
        Err(VmError::WriteProtected)
    );
    assert!(!is_resident(&user, base));

    // Present: the CPU raises a protection fault, same answer.
    machine.read(&mut user, base, 1).unwrap();
    assert_eq!(
        machine.write(&mut user, base, b"x"),
        Err(VmError::WriteProtected)
    );
    user.aspace.munmap(&machine.vm, VirtAddr::new(base)).unwrap();
    assert_eq!(file.contents(), [3u8; 64]);
}

#[test]
fn teardown_flushes_every_mapping() {
    let machine = Machine::new(4, 4);
    let mut user = machine.user();
    let (file, handle) = file(&[0u8; 2 * PAGE_SIZE]);
    let base = data_page(0);

    user.aspace
        .mmap(&machine.vm, VirtAddr::new(base), 2 * PAGE_SIZE, true, &handle, 0)
        .unwrap();
    machine
        .write(&mut user, base + PAGE_SIZE as u64, b"tail")
        .unwrap();

    user.aspace.teardown(&machine.vm).unwrap();
    assert_eq!(&file.contents()[PAGE_SIZE..PAGE_SIZE + 4], b"tail");
    assert!(user.aspace.mmaps().is_empty());
    assert_eq!(user.aspace.teardown(&machine.vm), Ok(()));
}

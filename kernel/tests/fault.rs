mod common;

use common::{data_page, Machine, STACK_RSP};
use vm_core::config::{MAX_STACK_SIZE, USER_STACK_TOP};
use vm_core::{
    handle_page_fault, try_handle_fault, ErrorClass, FaultCause, PageFault, PageMarkers,
    PageTarget, VmConfig, VmError, VmType, PAGE_SIZE,
};
use x86_64::VirtAddr;

const PAGE: u64 = PAGE_SIZE as u64;

#[test]
fn push_below_rsp_grows_the_stack() {
    let machine = Machine::new(4, 4);
    let mut user = machine.user();
    let rsp = USER_STACK_TOP - 0x10;
    user.rsp = rsp;

    // `push` writes 8 bytes below rsp.
    machine.write(&mut user, rsp - 8, &[0xEE; 8]).unwrap();
    assert_eq!(user.aspace.stack_pages(), 1);
    assert_eq!(user.aspace.spt().len(), 1);

    let page = user.aspace.find(VirtAddr::new(rsp - 8)).unwrap();
    {
        let page = page.lock();
        assert!(page.markers().contains(PageMarkers::STACK));
        assert_eq!(page.target_type(), VmType::Anon);
        assert!(page.writable());
        assert_eq!(page.addr().as_u64(), USER_STACK_TOP - PAGE);
    }

    // Same page again: no new page.
    machine.write(&mut user, rsp - 16, &[1; 8]).unwrap();
    assert_eq!(user.aspace.stack_pages(), 1);
}

#[test]
fn each_stack_page_is_created_once() {
    let machine = Machine::new(8, 8);
    let mut user = machine.user();

    for depth in 1..=4u64 {
        let rsp = USER_STACK_TOP - depth * PAGE;
        user.rsp = rsp;
        machine.write(&mut user, rsp, &depth.to_le_bytes()).unwrap();
        assert_eq!(user.aspace.stack_pages(), depth as usize);
    }
    for depth in 1..=4u64 {
        let bytes = machine
            .read(&mut user, USER_STACK_TOP - depth * PAGE, 8)
            .unwrap();
        assert_eq!(bytes, depth.to_le_bytes());
    }
    assert_eq!(user.aspace.spt().len(), 4);
}

#[test]
fn fault_far_below_rsp_is_not_stack_growth() {
    let machine = Machine::new(4, 4);
    let mut user = machine.user();
    user.rsp = USER_STACK_TOP - 0x100;

    let err = machine
        .touch(&mut user, USER_STACK_TOP - 4 * PAGE, true)
        .unwrap_err();
    assert_eq!(err, VmError::SegmentationFault);
    assert_eq!(err.class(), ErrorClass::Protection);
    assert!(err.is_fatal());
    assert!(user.aspace.spt().is_empty());
}

#[test]
fn stack_growth_stops_at_the_size_limit() {
    let machine = Machine::new(4, 4);
    let mut user = machine.user();
    let floor = USER_STACK_TOP - MAX_STACK_SIZE;

    user.rsp = floor;
    assert!(machine.touch(&mut user, floor, true).is_ok());

    user.rsp = floor - PAGE;
    assert_eq!(
        machine.touch(&mut user, floor - PAGE, true),
        Err(VmError::SegmentationFault)
    );
    assert_eq!(user.aspace.stack_pages(), 1);
}

#[test]
fn stack_top_itself_is_outside_the_stack() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    user.rsp = STACK_RSP;
    assert_eq!(
        machine.touch(&mut user, USER_STACK_TOP, false),
        Err(VmError::SegmentationFault)
    );
}

#[test]
fn failed_stack_growth_leaves_no_page() {
    let machine = Machine::new(0, 0);
    let mut user = machine.user();
    user.rsp = USER_STACK_TOP - 8;

    assert_eq!(
        machine.touch(&mut user, USER_STACK_TOP - 16, true),
        Err(VmError::OutOfFrames)
    );
    assert!(user.aspace.spt().is_empty());
}

#[test]
fn null_and_kernel_addresses_are_fatal() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    let vm = &machine.vm;
    let user_code = FaultCause::USER.bits();

    for addr in [0u64, 8, PAGE - 1] {
        let fault = PageFault::from_error_code(addr, user_code, STACK_RSP);
        assert_eq!(
            handle_page_fault(vm, &mut user.aspace, &fault),
            Err(VmError::NullAddress)
        );
    }

    for addr in [
        0x0000_8000_0000_0000u64,
        0xffff_8000_0000_1000,
        0x1234_5678_9abc_def0,
    ] {
        let fault = PageFault::from_error_code(addr, user_code, STACK_RSP);
        assert_eq!(
            handle_page_fault(vm, &mut user.aspace, &fault),
            Err(VmError::KernelAddress)
        );
        assert!(!try_handle_fault(vm, &mut user.aspace, &fault));
    }
}

#[test]
fn reserved_bit_fault_is_rejected() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    user.aspace
        .alloc_lazy(
            &machine.vm,
            PageTarget::Anon,
            VirtAddr::new(data_page(0)),
            true,
            None,
        )
        .unwrap();

    let code = (FaultCause::USER | FaultCause::PRESENT | FaultCause::RESERVED).bits();
    let fault = PageFault::from_error_code(data_page(0), code, STACK_RSP);
    assert_eq!(
        handle_page_fault(&machine.vm, &mut user.aspace, &fault),
        Err(VmError::ReservedBit)
    );
}

#[test]
fn present_fault_without_bad_write_is_a_violation() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    user.aspace
        .alloc_lazy(
            &machine.vm,
            PageTarget::Anon,
            VirtAddr::new(data_page(0)),
            true,
            None,
        )
        .unwrap();
    machine.touch(&mut user, data_page(0), true).unwrap();

    // e.g. an instruction fetch from a no-execute page
    let cause = FaultCause::USER | FaultCause::PRESENT | FaultCause::INSTRUCTION_FETCH;
    let code = cause.bits();
    let fault = PageFault::from_error_code(data_page(0), code, STACK_RSP);
    assert_eq!(
        handle_page_fault(&machine.vm, &mut user.aspace, &fault),
        Err(VmError::ProtectionViolation)
    );
}

#[test]
fn unknown_address_is_a_segfault() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    assert_eq!(
        machine.touch(&mut user, data_page(3), false),
        Err(VmError::SegmentationFault)
    );
}

#[test]
fn kernel_mode_fault_on_user_page_is_resolved() {
    let machine = Machine::new(2, 2);
    let mut user = machine.user();
    user.aspace
        .alloc_lazy(
            &machine.vm,
            PageTarget::Anon,
            VirtAddr::new(data_page(0)),
            true,
            None,
        )
        .unwrap();

    // The kernel copying a syscall buffer: not present, write, supervisor.
    let code = FaultCause::WRITE.bits();
    let fault = PageFault::from_error_code(data_page(0) + 0x80, code, STACK_RSP);
    assert!(try_handle_fault(&machine.vm, &mut user.aspace, &fault));
    assert_eq!(machine.vm.resident_frames(), 1);
}

#[test]
fn custom_layout_moves_the_stack() {
    let config = VmConfig {
        user_stack_top: 0x0000_4000_0000,
        max_stack_size: 4 * PAGE,
        ..VmConfig::DEFAULT
    };
    let machine = Machine::with_config(config, 4, 4);
    let mut user = machine.user();

    let rsp = 0x0000_4000_0000 - 8;
    user.rsp = rsp;
    assert!(machine.touch(&mut user, rsp, true).is_ok());
    let rsp = 0x0000_4000_0000 - 5 * PAGE;
    user.rsp = rsp;
    assert_eq!(
        machine.touch(&mut user, rsp, true),
        Err(VmError::SegmentationFault)
    );
}

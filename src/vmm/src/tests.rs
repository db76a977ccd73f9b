// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use apf::uapi::*;
use apf::IrqLine;
use arch::aarch64::layout::DRAM_MEM_START;
use arch::aarch64::regs::{PSR_MODE_EL0T, PSR_MODE_EL1H};
use arch::aarch64::smccc::{ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC, SMCCC_RET_SUCCESS};
use sdei::uapi::*;
use sdei::*;
use vm_memory::{Bytes, GuestAddress};

use crate::vmm_config::VmConfig;
use crate::{Error, HostPageFill, Vcpu, VcpuEmulation, Vm};

const SHARED_NUM: u64 = 0x4040_0001;
const PRIVATE_NORMAL_NUM: u64 = 0x4040_0002;
const ENTRY: u64 = 0x1000;
const NORMAL_ENTRY: u64 = 0x2000;
const GUEST_PC: u64 = 0xffff_0000_0010_0000;

#[derive(Default)]
struct TestIrq {
    lines: Mutex<Vec<(usize, u32, bool)>>,
}

impl IrqLine for TestIrq {
    fn set_irq(&self, vcpu_idx: usize, irq: u32, level: bool) -> io::Result<()> {
        self.lines.lock().unwrap().push((vcpu_idx, irq, level));
        Ok(())
    }
}

fn config() -> VmConfig {
    let mut config = VmConfig {
        vcpu_count: 2,
        mem_size_mib: 16,
        ..Default::default()
    };
    config.sdei_events.push(SdeiEventState {
        num: SHARED_NUM,
        type_: SDEI_EVENT_TYPE_SHARED,
        signaled: 0,
        priority: SDEI_EVENT_PRIORITY_NORMAL,
    });
    config.sdei_events.push(SdeiEventState {
        num: PRIVATE_NORMAL_NUM,
        type_: SDEI_EVENT_TYPE_PRIVATE,
        signaled: 0,
        priority: SDEI_EVENT_PRIORITY_NORMAL,
    });
    config
}

fn new_vm() -> (Vm, Arc<TestIrq>) {
    let irq = Arc::new(TestIrq::default());
    let vm = Vm::new(&config(), Some(irq.clone()), Arc::new(HostPageFill)).unwrap();
    (vm, irq)
}

/// Issues a hypercall from the guest and returns x0.
fn call(vcpu: &mut Vcpu, func: u32, args: &[u64]) -> u64 {
    let regs = vcpu.regs_mut();
    regs.regs[0] = u64::from(func);
    for (i, arg) in args.iter().enumerate() {
        regs.regs[i + 1] = *arg;
    }
    assert_eq!(vcpu.handle_hypercall(), VcpuEmulation::Handled);
    vcpu.regs().regs[0]
}

fn register(vcpu: &mut Vcpu, num: u64, entry: u64) -> u64 {
    call(
        vcpu,
        SDEI_1_0_FN_SDEI_EVENT_REGISTER,
        &[num, entry, num + 1, SDEI_EVENT_REGISTER_RM_ANY, 0],
    )
}

fn kevent_count(vm: &Vm) -> u32 {
    let mut cmd = KvmSdeiCmd::new(KVM_SDEI_CMD_GET_KEVENT_COUNT);
    vm.sdei_ioctl(&mut cmd).unwrap();
    cmd.count
}

fn inject(vcpu: &Vcpu, num: u64) {
    let mut cmd = KvmSdeiCmd::new(KVM_SDEI_CMD_INJECT_EVENT);
    cmd.num = num;
    vcpu.sdei_ioctl(&mut cmd).unwrap();
}

fn set_guest_context(vcpu: &mut Vcpu) {
    let regs = vcpu.regs_mut();
    for (i, reg) in regs.regs.iter_mut().enumerate() {
        *reg = 0xa000 + i as u64;
    }
    regs.sp = 0x8000;
    regs.pc = GUEST_PC;
    regs.pstate = PSR_MODE_EL0T;
}

#[test]
fn test_register_unregister() {
    let (vm, _) = new_vm();
    let mut vcpu = vm.create_vcpu(0).unwrap();

    for num in [KVM_SDEI_DEFAULT_NUM, SHARED_NUM, PRIVATE_NORMAL_NUM] {
        assert_eq!(register(&mut vcpu, num, ENTRY), SDEI_SUCCESS);
        assert_eq!(kevent_count(&vm), 1);
        assert_eq!(
            call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_UNREGISTER, &[num]),
            SDEI_SUCCESS
        );
        assert_eq!(kevent_count(&vm), 0);
    }
}

#[test]
fn test_enable_requires_registration() {
    let (vm, _) = new_vm();
    let mut vcpu = vm.create_vcpu(0).unwrap();
    let num = KVM_SDEI_DEFAULT_NUM;

    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[num]),
        SdeiError::Denied.to_reg()
    );
    assert_eq!(register(&mut vcpu, num, ENTRY), SDEI_SUCCESS);
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[num]),
        SDEI_SUCCESS
    );
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[num]),
        SdeiError::Denied.to_reg()
    );
}

#[test]
fn test_mask_idempotence() {
    let (vm, _) = new_vm();
    let mut vcpu = vm.create_vcpu(0).unwrap();

    // vCPUs start masked.
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_UNMASK, &[]),
        SDEI_SUCCESS
    );
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_UNMASK, &[]),
        SdeiError::Denied.to_reg()
    );
    assert_eq!(call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_MASK, &[]), SDEI_SUCCESS);
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_MASK, &[]),
        SdeiError::Denied.to_reg()
    );
}

#[test]
fn test_default_event_round_trip() {
    let (vm, _) = new_vm();
    let mut vcpu = vm.create_vcpu(0).unwrap();
    let num = KVM_SDEI_DEFAULT_NUM;

    assert_eq!(register(&mut vcpu, num, ENTRY), SDEI_SUCCESS);
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[num]),
        SDEI_SUCCESS
    );
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_UNMASK, &[]),
        SDEI_SUCCESS
    );

    set_guest_context(&mut vcpu);
    let before = *vcpu.regs();
    inject(&vcpu, num);
    vcpu.pre_enter();

    let regs = *vcpu.regs();
    assert_eq!(regs.pc, ENTRY);
    assert_eq!(regs.regs[0], num);
    assert_eq!(regs.regs[1], num + 1);
    assert_eq!(regs.regs[2], GUEST_PC);
    assert_eq!(regs.regs[3], PSR_MODE_EL0T);
    assert_eq!(regs.pstate & 0xf, PSR_MODE_EL1H);
    assert_eq!(vm.sdei().unwrap().kvm_event(num).unwrap().refcount(), 1);

    // The handler clobbers a register outside the saved set.
    vcpu.regs_mut().regs[20] = 0xdead;
    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_CONTEXT, &[2]),
        0xa002
    );
    vcpu.regs_mut().regs[0] = u64::from(SDEI_1_0_FN_SDEI_EVENT_COMPLETE);
    assert_eq!(vcpu.handle_hypercall(), VcpuEmulation::Handled);

    let after = *vcpu.regs();
    assert_eq!(after.pc, before.pc);
    assert_eq!(after.pstate, before.pstate);
    assert_eq!(after.sp, before.sp);
    for i in 0..31 {
        if i != 20 {
            assert_eq!(after.regs[i], before.regs[i], "x{i}");
        }
    }
    assert_eq!(after.regs[20], 0xdead);
    assert_eq!(vm.sdei().unwrap().kvm_event(num).unwrap().refcount(), 0);
}

#[test]
fn test_critical_dispatched_first() {
    let (vm, _) = new_vm();
    let mut vcpu = vm.create_vcpu(0).unwrap();

    assert_eq!(
        register(&mut vcpu, PRIVATE_NORMAL_NUM, NORMAL_ENTRY),
        SDEI_SUCCESS
    );
    assert_eq!(register(&mut vcpu, KVM_SDEI_DEFAULT_NUM, ENTRY), SDEI_SUCCESS);
    for num in [PRIVATE_NORMAL_NUM, KVM_SDEI_DEFAULT_NUM] {
        assert_eq!(
            call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[num]),
            SDEI_SUCCESS
        );
    }
    call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_UNMASK, &[]);

    set_guest_context(&mut vcpu);
    inject(&vcpu, PRIVATE_NORMAL_NUM);
    inject(&vcpu, KVM_SDEI_DEFAULT_NUM);

    vcpu.pre_enter();
    assert_eq!(vcpu.regs().pc, ENTRY);
    assert_eq!(vcpu.regs().regs[0], KVM_SDEI_DEFAULT_NUM);

    vcpu.regs_mut().regs[0] = u64::from(SDEI_1_0_FN_SDEI_EVENT_COMPLETE);
    vcpu.handle_hypercall();
    assert_eq!(vcpu.regs().pc, GUEST_PC);

    vcpu.pre_enter();
    assert_eq!(vcpu.regs().pc, NORMAL_ENTRY);
    assert_eq!(vcpu.regs().regs[0], PRIVATE_NORMAL_NUM);
}

#[test]
fn test_one_bound_event_per_number() {
    let (vm, _) = new_vm();
    let mut vcpu0 = vm.create_vcpu(0).unwrap();
    let mut vcpu1 = vm.create_vcpu(1).unwrap();

    // Private events keep one slot per vCPU.
    assert_eq!(register(&mut vcpu0, PRIVATE_NORMAL_NUM, 0x1000), SDEI_SUCCESS);
    assert_eq!(register(&mut vcpu1, PRIVATE_NORMAL_NUM, 0x2000), SDEI_SUCCESS);
    assert_eq!(kevent_count(&vm), 1);
    let kske = vm.sdei().unwrap().kvm_event(PRIVATE_NORMAL_NUM).unwrap();
    assert_eq!(kske.entry(0), 0x1000);
    assert_eq!(kske.entry(1), 0x2000);

    // Shared events have a single slot, so the second vCPU is refused.
    assert_eq!(register(&mut vcpu0, SHARED_NUM, 0x3000), SDEI_SUCCESS);
    assert_eq!(
        register(&mut vcpu1, SHARED_NUM, 0x4000),
        SdeiError::Denied.to_reg()
    );
    assert_eq!(kevent_count(&vm), 2);
}

#[test]
fn test_bound_events_migrate() {
    let (src, _) = new_vm();
    let mut src_vcpu0 = src.create_vcpu(0).unwrap();
    let mut src_vcpu1 = src.create_vcpu(1).unwrap();

    assert_eq!(register(&mut src_vcpu0, KVM_SDEI_DEFAULT_NUM, ENTRY), SDEI_SUCCESS);
    assert_eq!(
        register(&mut src_vcpu1, PRIVATE_NORMAL_NUM, NORMAL_ENTRY),
        SDEI_SUCCESS
    );
    assert_eq!(
        call(&mut src_vcpu1, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[PRIVATE_NORMAL_NUM]),
        SDEI_SUCCESS
    );
    call(&mut src_vcpu1, SDEI_1_0_FN_SDEI_PE_UNMASK, &[]);

    let mut saved = Vec::new();
    let mut cmd = KvmSdeiCmd::new(KVM_SDEI_CMD_GET_KEVENT);
    cmd.num = KVM_SDEI_INVALID_NUM;
    loop {
        match src.sdei_ioctl(&mut cmd) {
            Ok(()) => saved.push(cmd.kske_state),
            Err(e) => {
                assert_eq!(e.errno(), libc::ENOENT);
                break;
            }
        }
    }
    assert_eq!(
        saved.iter().map(|state| state.num).collect::<Vec<_>>(),
        vec![KVM_SDEI_DEFAULT_NUM, PRIVATE_NORMAL_NUM]
    );

    let mut vcpu_cmd = KvmSdeiCmd::new(KVM_SDEI_CMD_GET_VCPU_STATE);
    src_vcpu1.sdei_ioctl(&mut vcpu_cmd).unwrap();
    assert_eq!(vcpu_cmd.vcpu_state.masked, 0);

    let (dst, _) = new_vm();
    for state in &saved {
        let mut cmd = KvmSdeiCmd::new(KVM_SDEI_CMD_SET_KEVENT);
        cmd.kske_state = *state;
        dst.sdei_ioctl(&mut cmd).unwrap();
        assert_eq!(dst.sdei_ioctl(&mut cmd).unwrap_err().errno(), libc::EEXIST);
    }
    assert_eq!(kevent_count(&dst), 2);

    let mut dst_vcpu1 = dst.create_vcpu(1).unwrap();
    vcpu_cmd.cmd = KVM_SDEI_CMD_SET_VCPU_STATE;
    dst_vcpu1.sdei_ioctl(&mut vcpu_cmd).unwrap();
    assert!(!dst_vcpu1.sdei().unwrap().is_masked());

    // The handler registered on the source runs on the destination.
    set_guest_context(&mut dst_vcpu1);
    inject(&dst_vcpu1, PRIVATE_NORMAL_NUM);
    dst_vcpu1.pre_enter();
    assert_eq!(dst_vcpu1.regs().pc, NORMAL_ENTRY);
    assert_eq!(dst_vcpu1.regs().regs[1], PRIVATE_NORMAL_NUM + 1);

    // Registered but never enabled on the source.
    let mut dst_vcpu0 = dst.create_vcpu(0).unwrap();
    assert_eq!(
        call(&mut dst_vcpu0, SDEI_1_0_FN_SDEI_EVENT_STATUS, &[KVM_SDEI_DEFAULT_NUM]),
        SdeiEventStatus::REGISTERED.bits()
    );
}

#[test]
fn test_unregister_while_running() {
    let (vm, _) = new_vm();
    let mut vcpu = vm.create_vcpu(0).unwrap();
    let num = KVM_SDEI_DEFAULT_NUM;

    register(&mut vcpu, num, ENTRY);
    call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[num]);
    call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_UNMASK, &[]);
    set_guest_context(&mut vcpu);
    inject(&vcpu, num);
    vcpu.pre_enter();
    assert_eq!(vcpu.regs().pc, ENTRY);

    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_UNREGISTER, &[num]),
        SdeiError::Pending.to_reg()
    );
    assert_eq!(kevent_count(&vm), 1);

    vcpu.regs_mut().regs[0] = u64::from(SDEI_1_0_FN_SDEI_EVENT_COMPLETE);
    vcpu.handle_hypercall();
    assert_eq!(vcpu.regs().pc, GUEST_PC);
    assert_eq!(kevent_count(&vm), 0);
}

#[test]
fn test_sdei_disabled() {
    let config = VmConfig {
        sdei: false,
        irqchip: false,
        async_pf: false,
        ..config()
    };
    let vm = Vm::new(&config, None, Arc::new(HostPageFill)).unwrap();
    let mut vcpu = vm.create_vcpu(0).unwrap();

    assert_eq!(
        call(&mut vcpu, SDEI_1_0_FN_SDEI_VERSION, &[]),
        SdeiError::NotSupported.to_reg()
    );
    let mut cmd = KvmSdeiCmd::new(KVM_SDEI_CMD_GET_VERSION);
    assert_eq!(vm.sdei_ioctl(&mut cmd).unwrap_err().errno(), libc::EPERM);
    let mut cmd = KvmArmAsyncPfCmd::new(KVM_ARM_ASYNC_PF_CMD_GET_VERSION);
    assert!(matches!(
        vcpu.apf_ioctl(&mut cmd),
        Err(Error::AsyncPfUnavailable)
    ));
    assert!(!vcpu.handle_page_fault(0, DRAM_MEM_START));

    // The async PF call is unknown without the feature.
    assert_eq!(
        call(
            &mut vcpu,
            ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC,
            &[ARM_SMCCC_KVM_FUNC_ASYNC_PF_VERSION]
        ) as i64,
        -1
    );
}

#[test]
fn test_vm_errors() {
    let config = VmConfig {
        vcpu_count: 0,
        ..config()
    };
    assert!(matches!(
        Vm::new(&config, None, Arc::new(HostPageFill)),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Vm::new(&self::config(), None, Arc::new(HostPageFill)),
        Err(Error::MissingIrqchip)
    ));

    let (vm, _) = new_vm();
    assert!(matches!(vm.create_vcpu(2), Err(Error::VcpuIndex(2))));

    let mut cmd = KvmArmAsyncPfCmd::new(KVM_ARM_ASYNC_PF_CMD_GET_VERSION);
    vm.apf_ioctl(&mut cmd).unwrap();
    assert_eq!(cmd.version, KVM_ASYNC_PF_VERSION);
}

#[test]
fn test_pre_enter_drains_kick() {
    let (vm, _) = new_vm();
    let mut vcpu = vm.create_vcpu(0).unwrap();

    // Nothing to drain.
    vcpu.pre_enter();

    vcpu.kick_evt().write(2).unwrap();
    vcpu.pre_enter();
    assert_eq!(
        vcpu.kick_evt().read().unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );
}

fn wait_kick(vcpu: &Vcpu) {
    for _ in 0..500 {
        if vcpu.kick_evt().read().is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("vcpu {} was never kicked", vcpu.idx());
}

#[test]
fn test_async_page_fault() {
    const APF_IRQ: u32 = 0x21;
    let control = DRAM_MEM_START + 0x1000;
    let notification = |vm: &Vm| -> (u32, u32) {
        (
            vm.mem().read_obj(GuestAddress(control)).unwrap(),
            vm.mem().read_obj(GuestAddress(control + 4)).unwrap(),
        )
    };

    let (vm, irq) = new_vm();
    let mut vcpu = vm.create_vcpu(1).unwrap();
    let num = KVM_SDEI_DEFAULT_NUM;

    register(&mut vcpu, num, ENTRY);
    call(&mut vcpu, SDEI_1_0_FN_SDEI_EVENT_ENABLE, &[num]);
    call(&mut vcpu, SDEI_1_0_FN_SDEI_PE_UNMASK, &[]);

    let mut cmd = KvmArmAsyncPfCmd::new(KVM_ARM_ASYNC_PF_CMD_SET_SDEI);
    cmd.sdei = num;
    vcpu.apf_ioctl(&mut cmd).unwrap();
    let mut cmd = KvmArmAsyncPfCmd::new(KVM_ARM_ASYNC_PF_CMD_SET_IRQ);
    cmd.irq = APF_IRQ;
    vcpu.apf_ioctl(&mut cmd).unwrap();

    let flags = AsyncPfControlFlags::ENABLED | AsyncPfControlFlags::SEND_ALWAYS;
    assert_eq!(
        call(
            &mut vcpu,
            ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC,
            &[ARM_SMCCC_KVM_FUNC_ASYNC_PF_ENABLE, control | flags.bits(), 0]
        ) as i64,
        SMCCC_RET_SUCCESS
    );

    // Enabling wakes every parked task with a token-less page-ready.
    wait_kick(&vcpu);
    vcpu.pre_enter();
    assert_eq!(notification(&vm), (KVM_PV_REASON_PAGE_READY, !0));
    assert_eq!(*irq.lines.lock().unwrap(), vec![(1, APF_IRQ, true)]);
    vm.mem().write_obj(0u64, GuestAddress(control)).unwrap();
    call(
        &mut vcpu,
        ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC,
        &[ARM_SMCCC_KVM_FUNC_ASYNC_PF_IRQ_ACK],
    );
    assert_eq!(irq.lines.lock().unwrap().last(), Some(&(1, APF_IRQ, false)));
    irq.lines.lock().unwrap().clear();

    // A fault is deferred and reported through the SDEI event.
    set_guest_context(&mut vcpu);
    let gpa = DRAM_MEM_START + 0x10_0000;
    assert!(vcpu.handle_page_fault(0, gpa));
    assert_eq!(notification(&vm), (KVM_PV_REASON_PAGE_NOT_PRESENT, 1));
    // Already outstanding.
    assert!(!vcpu.handle_page_fault(0, gpa));

    // The page came in before the guest was diverted: the SDEI event is
    // withdrawn and no page-ready is needed.
    wait_kick(&vcpu);
    vcpu.pre_enter();
    assert_eq!(vcpu.regs().pc, GUEST_PC);
    assert_eq!(vcpu.sdei().unwrap().queued_events(), 0);
    assert_eq!(notification(&vm), (0, 0));
    assert!(irq.lines.lock().unwrap().is_empty());
    assert!(vcpu.handle_page_fault(0, gpa));
}

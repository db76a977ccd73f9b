// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use arch::aarch64::regs::VcpuRegs;

use crate::defs::*;
use crate::registry::SdeiKvm;
use crate::vcpu::SdeiVcpu;

/// What the caller has to do once an SDEI call has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdeiExit {
    /// Resume the guest.
    Handled,
    /// Resume the guest with a pending interrupt injected first.
    InjectIrq,
}

/// Whether `func_id` belongs to the SDEI function range.
pub fn is_sdei_call(func_id: u32) -> bool {
    (SDEI_1_0_FN_BASE..=SDEI_1_0_FN_LAST).contains(&func_id)
}

/// Handles a trapped SDEI call. The function id and its arguments are taken
/// from x0-x5 and the result is written back to x0, with x1-x3 cleared.
pub fn hypercall(kvm: Option<&SdeiKvm>, vcpu: Option<&SdeiVcpu>, regs: &mut VcpuRegs) -> SdeiExit {
    let func = regs.smccc_function();
    let (kvm, vcpu) = match (kvm, vcpu) {
        (Some(kvm), Some(vcpu)) => (kvm, vcpu),
        _ => {
            regs.smccc_set_retval(SdeiError::NotSupported.to_reg(), 0, 0, 0);
            return SdeiExit::Handled;
        }
    };

    let ret = match func {
        SDEI_1_0_FN_SDEI_VERSION => Ok(SDEI_IMPLEMENTED_VERSION),
        SDEI_1_0_FN_SDEI_EVENT_REGISTER => kvm.event_register(
            vcpu,
            regs.smccc_arg(1),
            regs.smccc_arg(2),
            regs.smccc_arg(3),
            regs.smccc_arg(4),
            regs.smccc_arg(5),
        ),
        SDEI_1_0_FN_SDEI_EVENT_ENABLE => kvm.event_enable(vcpu, regs.smccc_arg(1), true),
        SDEI_1_0_FN_SDEI_EVENT_DISABLE => kvm.event_enable(vcpu, regs.smccc_arg(1), false),
        SDEI_1_0_FN_SDEI_EVENT_CONTEXT => vcpu.context(regs.smccc_arg(1)),
        SDEI_1_0_FN_SDEI_EVENT_COMPLETE | SDEI_1_0_FN_SDEI_EVENT_COMPLETE_AND_RESUME => {
            // On success the interrupted context has been restored and must
            // not be clobbered by a return value.
            match vcpu.complete(kvm, regs) {
                Ok(()) if func == SDEI_1_0_FN_SDEI_EVENT_COMPLETE_AND_RESUME => {
                    return SdeiExit::InjectIrq
                }
                Ok(()) => return SdeiExit::Handled,
                Err(e) => Err(e),
            }
        }
        SDEI_1_0_FN_SDEI_EVENT_UNREGISTER => kvm.event_unregister(vcpu, regs.smccc_arg(1)),
        SDEI_1_0_FN_SDEI_EVENT_STATUS => kvm.event_status(vcpu, regs.smccc_arg(1)),
        SDEI_1_0_FN_SDEI_EVENT_GET_INFO => {
            kvm.event_info(regs.smccc_arg(1), regs.smccc_arg(2))
        }
        SDEI_1_0_FN_SDEI_EVENT_ROUTING_SET => kvm.event_routing_set(
            regs.smccc_arg(1),
            regs.smccc_arg(2),
            regs.smccc_arg(3),
        ),
        SDEI_1_0_FN_SDEI_PE_MASK => vcpu.mask(true),
        SDEI_1_0_FN_SDEI_PE_UNMASK => vcpu.mask(false),
        SDEI_1_0_FN_SDEI_PRIVATE_RESET => kvm.reset(vcpu, true),
        SDEI_1_0_FN_SDEI_SHARED_RESET => kvm.reset(vcpu, false),
        // Interrupt binding, signalling and feature queries are not offered.
        _ => Err(SdeiError::NotSupported),
    };

    let val = match ret {
        Ok(val) => val,
        Err(e) => {
            debug!("vcpu {}: SDEI call {func:#x} failed: {e:?}", vcpu.idx());
            e.to_reg()
        }
    };
    regs.smccc_set_retval(val, 0, 0, 0);
    SdeiExit::Handled
}

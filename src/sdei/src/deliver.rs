// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use arch::aarch64::regs::{handler_pstate, VcpuRegs};

use crate::defs::SdeiError;
use crate::event::{SdeiKvmEvent, SdeiNotifyState};
use crate::registry::SdeiKvm;
use crate::uapi::{SdeiVcpuRegs, KVM_SDEI_INVALID_NUM, KVM_SDEI_SAVED_REGS};
use crate::vcpu::{SdeiVcpu, SdeiVcpuEvent};

fn save_context(regs: &VcpuRegs) -> SdeiVcpuRegs {
    let mut saved = SdeiVcpuRegs {
        pc: regs.pc,
        pstate: regs.pstate,
        ..Default::default()
    };
    saved.regs.copy_from_slice(&regs.regs[..KVM_SDEI_SAVED_REGS]);
    saved
}

fn restore_context(regs: &mut VcpuRegs, saved: &SdeiVcpuRegs) {
    regs.regs[..KVM_SDEI_SAVED_REGS].copy_from_slice(&saved.regs);
    regs.pc = saved.pc;
    regs.pstate = saved.pstate;
}

impl SdeiVcpu {
    /// Diverts the vCPU into the handler of the most urgent pending event,
    /// if one may run now. Called before entering the guest when a delivery
    /// request was raised.
    pub fn deliver(&self, kvm: &SdeiKvm, regs: &mut VcpuRegs) {
        let mut stale: Vec<SdeiVcpuEvent> = Vec::new();

        let delivered = {
            let mut events = self.lock();
            loop {
                let priority = match events.next_priority() {
                    Some(priority) => priority,
                    None => break None,
                };

                let kske = match events.events_mut(priority).front() {
                    Some(ksve) => ksve.kske.clone(),
                    None => break None,
                };
                let index = kske.slot(self.idx());
                if !(kske.is_registered(index) && kske.is_enabled(index)) {
                    if let Some(ksve) = events.events_mut(priority).pop_front() {
                        stale.push(ksve);
                    }
                    continue;
                }

                let (active_num, saved) = events.active_mut(priority);
                *saved = save_context(regs);
                *active_num = kske.num();

                regs.set_reg(0, kske.num());
                regs.set_reg(1, kske.param(index));
                regs.set_reg(2, saved.pc);
                regs.set_reg(3, saved.pstate);
                regs.spsr_el1 = saved.pstate;
                regs.pstate = handler_pstate(saved.pstate);
                regs.pc = kske.entry(index);

                break Some(kske);
            }
        };

        for ksve in stale {
            debug!(
                "vcpu {}: dropping stale SDEI event {:#x}",
                self.idx(),
                ksve.num()
            );
            kvm.put_kvm_event(&ksve.kske, ksve.refcount);
        }

        if let Some(kske) = delivered {
            debug!(
                "vcpu {}: delivering SDEI event {:#x} at {:#x}",
                self.idx(),
                kske.num(),
                regs.pc
            );
            notify(&kske, self.idx(), SdeiNotifyState::Delivered);
        }
    }

    /// EVENT_COMPLETE and EVENT_COMPLETE_AND_RESUME: returns the vCPU to the
    /// context interrupted by the running handler.
    pub fn complete(&self, kvm: &SdeiKvm, regs: &mut VcpuRegs) -> Result<(), SdeiError> {
        let kske = {
            let mut events = self.lock();
            let priority = events.running().ok_or(SdeiError::Denied)?;

            let (active_num, saved) = events.active_mut(priority);
            let num = *active_num;
            *active_num = KVM_SDEI_INVALID_NUM;
            restore_context(regs, saved);

            let list = events.events_mut(priority);
            let kske = match list.iter().position(|e| e.num() == num) {
                Some(pos) => {
                    let ksve = &mut list[pos];
                    ksve.refcount -= 1;
                    let kske = ksve.kske.clone();
                    if ksve.refcount == 0 {
                        list.remove(pos);
                    }
                    Some(kske)
                }
                None => None,
            };

            if events.has_pending() {
                self.make_request();
            }
            kske
        };

        let kske = match kske {
            Some(kske) => kske,
            None => {
                warn!("vcpu {}: completed SDEI event has no instance", self.idx());
                return Ok(());
            }
        };

        debug!(
            "vcpu {}: SDEI event {:#x} completed",
            self.idx(),
            kske.num()
        );
        notify(&kske, self.idx(), SdeiNotifyState::Completed);
        kvm.put_kvm_event(&kske, 1);
        Ok(())
    }
}

fn notify(kske: &Arc<SdeiKvmEvent>, vcpu_idx: usize, state: SdeiNotifyState) {
    if let Some(notifier) = kske.event().notifier() {
        notifier.notify(vcpu_idx, kske.num(), state);
    }
}

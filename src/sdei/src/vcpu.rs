// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::defs::{SdeiError, SdeiResult, SDEI_SUCCESS};
use crate::event::SdeiKvmEvent;
use crate::registry::SdeiKvm;
use crate::uapi::{
    kvm_sdei_is_valid_event_num, SdeiVcpuRegs, SdeiVcpuState, KVM_SDEI_INVALID_NUM,
    KVM_SDEI_MAX_VCPUS, KVM_SDEI_SAVED_REGS,
};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Priority {
    Critical,
    Normal,
}

/// A pending or running occurrence of a bound event on one vCPU.
pub(crate) struct SdeiVcpuEvent {
    pub kske: Arc<SdeiKvmEvent>,
    pub refcount: u32,
}

impl SdeiVcpuEvent {
    pub fn num(&self) -> u64 {
        self.kske.num()
    }
}

pub(crate) struct VcpuEvents {
    pub state: SdeiVcpuState,
    pub critical_events: VecDeque<SdeiVcpuEvent>,
    pub normal_events: VecDeque<SdeiVcpuEvent>,
}

impl VcpuEvents {
    pub fn events_mut(&mut self, priority: Priority) -> &mut VecDeque<SdeiVcpuEvent> {
        match priority {
            Priority::Critical => &mut self.critical_events,
            Priority::Normal => &mut self.normal_events,
        }
    }

    pub fn active_num(&self, priority: Priority) -> u64 {
        match priority {
            Priority::Critical => self.state.critical_num,
            Priority::Normal => self.state.normal_num,
        }
    }

    /// Slot of the running event of the given priority and its saved
    /// context.
    pub fn active_mut(&mut self, priority: Priority) -> (&mut u64, &mut SdeiVcpuRegs) {
        match priority {
            Priority::Critical => (
                &mut self.state.critical_num,
                &mut self.state.critical_regs,
            ),
            Priority::Normal => (&mut self.state.normal_num, &mut self.state.normal_regs),
        }
    }

    /// Priority of the handler currently executing, critical first since
    /// it may have preempted a normal one.
    pub fn running(&self) -> Option<Priority> {
        if self.state.critical_num != KVM_SDEI_INVALID_NUM {
            Some(Priority::Critical)
        } else if self.state.normal_num != KVM_SDEI_INVALID_NUM {
            Some(Priority::Normal)
        } else {
            None
        }
    }

    pub fn is_running(&self, num: u64) -> bool {
        self.state.critical_num == num || self.state.normal_num == num
    }

    pub fn has_pending(&self) -> bool {
        !self.critical_events.is_empty() || !self.normal_events.is_empty()
    }

    /// Queue to dispatch from next, if anything may be dispatched at all.
    pub fn next_priority(&self) -> Option<Priority> {
        if self.state.masked != 0 || self.state.critical_num != KVM_SDEI_INVALID_NUM {
            return None;
        }
        if !self.critical_events.is_empty() {
            return Some(Priority::Critical);
        }
        if self.state.normal_num != KVM_SDEI_INVALID_NUM {
            return None;
        }
        if !self.normal_events.is_empty() {
            return Some(Priority::Normal);
        }
        None
    }

    fn find(&self, num: u64) -> Option<(Priority, usize)> {
        if let Some(pos) = self.critical_events.iter().position(|e| e.num() == num) {
            return Some((Priority::Critical, pos));
        }
        self.normal_events
            .iter()
            .position(|e| e.num() == num)
            .map(|pos| (Priority::Normal, pos))
    }
}

/// SDEI state of a single vCPU.
pub struct SdeiVcpu {
    idx: usize,
    events: Mutex<VcpuEvents>,
    request: AtomicBool,
}

impl SdeiVcpu {
    /// Returns `None` when the vCPU index cannot be tracked by the per slot
    /// bitmaps, leaving SDEI unavailable on that vCPU.
    pub fn new(idx: usize) -> Option<Self> {
        if idx >= KVM_SDEI_MAX_VCPUS {
            warn!("vcpu {idx} is beyond the SDEI slot limit");
            return None;
        }

        Some(SdeiVcpu {
            idx,
            events: Mutex::new(VcpuEvents {
                state: SdeiVcpuState::default(),
                critical_events: VecDeque::new(),
                normal_events: VecDeque::new(),
            }),
            request: AtomicBool::new(false),
        })
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VcpuEvents> {
        self.events.lock().unwrap()
    }

    /// Asks for a delivery attempt at the next guest entry.
    pub fn make_request(&self) {
        self.request.store(true, Ordering::Release);
    }

    /// Consumes a pending delivery request.
    pub fn check_request(&self) -> bool {
        self.request.swap(false, Ordering::AcqRel)
    }

    pub fn has_request(&self) -> bool {
        self.request.load(Ordering::Acquire)
    }

    pub fn is_masked(&self) -> bool {
        self.lock().state.masked != 0
    }

    /// Whether a handler of either priority is executing on the vCPU.
    pub fn has_active_event(&self) -> bool {
        self.lock().running().is_some()
    }

    pub fn is_running(&self, num: u64) -> bool {
        self.lock().is_running(num)
    }

    /// Number of queued or running instances.
    pub fn queued_events(&self) -> usize {
        let events = self.lock();
        events.critical_events.len() + events.normal_events.len()
    }

    pub(crate) fn request_if_pending(&self) {
        let events = self.lock();
        if events.state.masked == 0 && events.has_pending() {
            self.make_request();
        }
    }

    /// PE_MASK and PE_UNMASK.
    pub fn mask(&self, mask: bool) -> SdeiResult {
        let mut events = self.lock();
        if (events.state.masked != 0) == mask {
            return Err(SdeiError::Denied);
        }

        events.state.masked = mask as u8;
        if !mask && events.has_pending() {
            self.make_request();
        }

        Ok(SDEI_SUCCESS)
    }

    /// EVENT_CONTEXT: reads a register saved when the running handler was
    /// entered.
    pub fn context(&self, index: u64) -> SdeiResult {
        if index >= KVM_SDEI_SAVED_REGS as u64 {
            return Err(SdeiError::InvalidParameters);
        }

        let mut events = self.lock();
        let priority = events.running().ok_or(SdeiError::Denied)?;
        let (_, regs) = events.active_mut(priority);
        Ok(regs.regs[index as usize])
    }

    /// Drops the references queued instances of `num` hold, keeping a
    /// running one alive. Returns the number of references released.
    pub(crate) fn discard_pending(&self, num: u64) -> u32 {
        let mut events = self.lock();
        let keep = events.is_running(num) as u32;
        let (priority, pos) = match events.find(num) {
            Some(found) => found,
            None => return 0,
        };

        let list = events.events_mut(priority);
        let dropped = list[pos].refcount - keep;
        if keep == 0 {
            list.remove(pos);
        } else {
            list[pos].refcount = keep;
        }

        dropped
    }

    /// Queues an occurrence of a bound event. With `immediate` set the
    /// request fails unless the event would be dispatched at the next guest
    /// entry.
    pub fn inject(&self, kvm: &SdeiKvm, num: u64, immediate: bool) -> Result<()> {
        if !kvm_sdei_is_valid_event_num(num) {
            return Err(Error::InvalidEventNumber(num));
        }

        let registry = kvm.lock();
        let kske = registry
            .find_kvm_event(num)
            .ok_or(Error::EventNotBound(num))?;
        let index = kske.slot(self.idx);
        if !(kske.is_registered(index) && kske.is_enabled(index)) {
            return Err(Error::EventNotReady(num));
        }

        let mut events = self.lock();
        if events.state.masked != 0 {
            return Err(Error::VcpuMasked);
        }

        let priority = if kske.event().is_critical() {
            Priority::Critical
        } else {
            Priority::Normal
        };

        if immediate {
            let busy = match priority {
                Priority::Critical => events.state.critical_num != KVM_SDEI_INVALID_NUM,
                Priority::Normal => events.running().is_some(),
            };
            if busy {
                return Err(Error::CannotDeliver(num));
            }
        }

        let list = events.events_mut(priority);
        match list.iter_mut().find(|e| e.num() == num) {
            Some(ksve) => ksve.refcount += 1,
            None => {
                list.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
                list.push_back(SdeiVcpuEvent {
                    kske: kske.clone(),
                    refcount: 1,
                });
            }
        }
        kske.get();
        self.make_request();

        debug!("vcpu {}: injected SDEI event {num:#x}", self.idx);
        Ok(())
    }

    /// Withdraws one queued occurrence of `num` that has not been
    /// dispatched yet.
    pub fn cancel(&self, kvm: &SdeiKvm, num: u64) -> Result<()> {
        if !kvm_sdei_is_valid_event_num(num) {
            return Err(Error::InvalidEventNumber(num));
        }

        let kske = {
            let mut events = self.lock();
            if events.is_running(num) {
                return Err(Error::EventRunning(num));
            }
            let (priority, pos) = events.find(num).ok_or(Error::EventNotPending(num))?;
            let list = events.events_mut(priority);
            let ksve = &mut list[pos];
            ksve.refcount -= 1;
            let kske = ksve.kske.clone();
            if ksve.refcount == 0 {
                list.remove(pos);
            }
            kske
        };

        kvm.put_kvm_event(&kske, 1);
        debug!("vcpu {}: cancelled SDEI event {num:#x}", self.idx);
        Ok(())
    }

    pub fn get_state(&self) -> SdeiVcpuState {
        self.lock().state
    }

    /// Restores the masked flag and saved contexts. Only accepted on an idle
    /// vCPU and for states without a running event, as nothing would back it.
    pub fn set_state(&self, state: &SdeiVcpuState) -> Result<()> {
        if state.critical_num != KVM_SDEI_INVALID_NUM || state.normal_num != KVM_SDEI_INVALID_NUM
        {
            return Err(Error::InvalidState);
        }

        let mut events = self.lock();
        if events.running().is_some() || events.has_pending() {
            return Err(Error::VcpuBusy);
        }

        events.state = *state;
        Ok(())
    }

    /// Drops every instance queued on the vCPU, as done when it is
    /// destroyed.
    pub fn destroy(&self, kvm: &SdeiKvm) {
        let released: Vec<SdeiVcpuEvent> = {
            let mut events = self.lock();
            events.state.critical_num = KVM_SDEI_INVALID_NUM;
            events.state.normal_num = KVM_SDEI_INVALID_NUM;
            let mut released: Vec<SdeiVcpuEvent> = events.critical_events.drain(..).collect();
            released.extend(events.normal_events.drain(..));
            released
        };

        for ksve in released {
            kvm.put_kvm_event(&ksve.kske, ksve.refcount);
        }
    }
}

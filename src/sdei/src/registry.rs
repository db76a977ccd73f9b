// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard};

use crate::defs::*;
use crate::event::{SdeiEvent, SdeiKvmEvent, SdeiNotifier};
use crate::uapi::{kvm_sdei_is_valid_event_num, SdeiEventState, KVM_SDEI_DEFAULT_NUM};
use crate::vcpu::SdeiVcpu;
use crate::{Error, Result};

/// Firmware events every VM starts with.
pub const DEFAULT_EVENTS: &[SdeiEventState] = &[SdeiEventState {
    num: KVM_SDEI_DEFAULT_NUM,
    type_: SDEI_EVENT_TYPE_PRIVATE,
    signaled: 1,
    priority: SDEI_EVENT_PRIORITY_CRITICAL,
}];

pub(crate) struct Registry {
    events: Vec<Arc<SdeiEvent>>,
    kvm_events: Vec<Arc<SdeiKvmEvent>>,
}

impl Registry {
    pub fn find_event(&self, num: u64) -> Option<&Arc<SdeiEvent>> {
        self.events.iter().find(|kse| kse.num() == num)
    }

    pub fn find_kvm_event(&self, num: u64) -> Option<&Arc<SdeiKvmEvent>> {
        self.kvm_events.iter().find(|kske| kske.num() == num)
    }

    pub fn kvm_events(&self) -> &[Arc<SdeiKvmEvent>] {
        &self.kvm_events
    }

    pub fn add_event(&mut self, state: SdeiEventState) -> Result<()> {
        if !kvm_sdei_is_valid_event_num(state.num)
            || state.type_ > SDEI_EVENT_TYPE_PRIVATE
            || state.priority > SDEI_EVENT_PRIORITY_CRITICAL
        {
            return Err(Error::InvalidEventNumber(state.num));
        }
        if self.find_event(state.num).is_some() {
            return Err(Error::EventExists(state.num));
        }

        self.events.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        self.events.push(Arc::new(SdeiEvent::new(state)));
        Ok(())
    }

    pub fn add_kvm_event(&mut self, kske: Arc<SdeiKvmEvent>) -> Result<()> {
        self.kvm_events
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.kvm_events.push(kske);
        Ok(())
    }

    fn remove_kvm_event(&mut self, kske: &Arc<SdeiKvmEvent>) {
        self.kvm_events.retain(|e| !Arc::ptr_eq(e, kske));
        debug!("SDEI event {:#x} released", kske.num());
    }

    /// Unbinds the handler of `vcpu` and drops its queued instances.
    /// Returns whether the event is still in flight.
    fn unregister_slot(&mut self, vcpu: &SdeiVcpu, kske: &Arc<SdeiKvmEvent>, index: usize) -> bool {
        kske.clear_enabled(index);
        kske.clear_registered(index);

        let dropped = vcpu.discard_pending(kske.num());
        if dropped > 0 {
            kske.put(dropped);
        }

        if kske.refcount() != 0 {
            return true;
        }
        if kske.registered_empty() {
            self.remove_kvm_event(kske);
        }
        false
    }
}

/// SDEI state shared by all vCPUs of a VM.
pub struct SdeiKvm {
    registry: Mutex<Registry>,
}

impl SdeiKvm {
    /// Builds the registry from a table of firmware event definitions.
    /// Returns `None`, leaving SDEI unavailable to the VM, when the table
    /// cannot be loaded.
    pub fn new(table: &[SdeiEventState]) -> Option<Self> {
        let mut registry = Registry {
            events: Vec::new(),
            kvm_events: Vec::new(),
        };

        for state in table {
            if let Err(e) = registry.add_event(*state) {
                warn!("SDEI disabled: cannot define event {:#x}: {e}", state.num);
                return None;
            }
        }

        Some(SdeiKvm {
            registry: Mutex::new(registry),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap()
    }

    /// Attaches a callback invoked when an instance of `num` is delivered or
    /// completed. Replaces any previous one.
    pub fn register_notifier(&self, num: u64, notifier: Arc<dyn SdeiNotifier>) -> Result<()> {
        if !kvm_sdei_is_valid_event_num(num) {
            return Err(Error::InvalidEventNumber(num));
        }

        let registry = self.lock();
        let kse = registry.find_event(num).ok_or(Error::UndefinedEvent(num))?;
        kse.set_notifier(notifier);
        Ok(())
    }

    pub fn kvm_event_count(&self) -> usize {
        self.lock().kvm_events.len()
    }

    pub fn kvm_event(&self, num: u64) -> Option<Arc<SdeiKvmEvent>> {
        self.lock().find_kvm_event(num).cloned()
    }

    /// Releases every bound event regardless of its state, as done when the
    /// VM is torn down.
    pub fn destroy(&self) {
        self.lock().kvm_events.clear();
    }

    /// Drops `count` references taken by vCPU instances and releases the
    /// bound event once it is unused. Must not be called with a vCPU lock
    /// held.
    pub(crate) fn put_kvm_event(&self, kske: &Arc<SdeiKvmEvent>, count: u32) {
        if kske.put(count) != 0 || !kske.registered_empty() {
            return;
        }

        let mut registry = self.lock();
        // The guest may have registered it again before we got the lock.
        if kske.is_unused() {
            registry.remove_kvm_event(kske);
        }
    }

    /// EVENT_REGISTER.
    pub fn event_register(
        &self,
        vcpu: &SdeiVcpu,
        num: u64,
        entry: u64,
        param: u64,
        route_mode: u64,
        route_affinity: u64,
    ) -> SdeiResult {
        if !kvm_sdei_is_valid_event_num(num) || !is_valid_route_mode(route_mode) {
            return Err(SdeiError::InvalidParameters);
        }

        let mut registry = self.lock();
        let kse = registry
            .find_event(num)
            .cloned()
            .ok_or(SdeiError::InvalidParameters)?;

        let kske = match registry.find_kvm_event(num).cloned() {
            Some(kske) => {
                let index = kske.slot(vcpu.idx());
                if kske.is_registered(index) {
                    return Err(SdeiError::Denied);
                }
                kske.set_route(route_mode as u8, route_affinity);
                kske
            }
            None => {
                let kske =
                    Arc::new(SdeiKvmEvent::new(kse).ok_or(SdeiError::OutOfResource)?);
                // A freshly bound event takes its routing mode from the
                // affinity argument.
                kske.set_route(route_affinity as u8, route_affinity);
                registry
                    .add_kvm_event(kske.clone())
                    .map_err(|_| SdeiError::OutOfResource)?;
                kske
            }
        };

        let index = kske.slot(vcpu.idx());
        kske.set_handler(index, entry, param);
        kske.set_registered(index);

        debug!(
            "vcpu {}: SDEI event {num:#x} registered, entry {entry:#x}",
            vcpu.idx()
        );
        Ok(SDEI_SUCCESS)
    }

    /// EVENT_ENABLE and EVENT_DISABLE.
    pub fn event_enable(&self, vcpu: &SdeiVcpu, num: u64, enable: bool) -> SdeiResult {
        if !kvm_sdei_is_valid_event_num(num) {
            return Err(SdeiError::InvalidParameters);
        }

        let registry = self.lock();
        if registry.find_event(num).is_none() {
            return Err(SdeiError::InvalidParameters);
        }
        let kske = registry.find_kvm_event(num).ok_or(SdeiError::Denied)?;

        let index = kske.slot(vcpu.idx());
        if !kske.is_registered(index) {
            return Err(SdeiError::Denied);
        }
        if enable && kske.refcount() != 0 {
            return Err(SdeiError::Pending);
        }
        if kske.is_enabled(index) == enable {
            return Err(SdeiError::Denied);
        }

        if enable {
            kske.set_enabled(index);
            vcpu.request_if_pending();
        } else {
            kske.clear_enabled(index);
        }

        debug!(
            "vcpu {}: SDEI event {num:#x} {}",
            vcpu.idx(),
            if enable { "enabled" } else { "disabled" }
        );
        Ok(SDEI_SUCCESS)
    }

    /// EVENT_UNREGISTER. Teardown of an event still being handled finishes
    /// when the handler completes.
    pub fn event_unregister(&self, vcpu: &SdeiVcpu, num: u64) -> SdeiResult {
        if !kvm_sdei_is_valid_event_num(num) {
            return Err(SdeiError::InvalidParameters);
        }

        let mut registry = self.lock();
        if registry.find_event(num).is_none() {
            return Err(SdeiError::InvalidParameters);
        }
        let kske = registry
            .find_kvm_event(num)
            .cloned()
            .ok_or(SdeiError::Denied)?;

        let index = kske.slot(vcpu.idx());
        if !kske.is_registered(index) {
            return Err(SdeiError::Denied);
        }

        if registry.unregister_slot(vcpu, &kske, index) {
            debug!("vcpu {}: SDEI event {num:#x} unregister pending", vcpu.idx());
            return Err(SdeiError::Pending);
        }

        debug!("vcpu {}: SDEI event {num:#x} unregistered", vcpu.idx());
        Ok(SDEI_SUCCESS)
    }

    /// EVENT_STATUS.
    pub fn event_status(&self, vcpu: &SdeiVcpu, num: u64) -> SdeiResult {
        if !kvm_sdei_is_valid_event_num(num) {
            return Err(SdeiError::InvalidParameters);
        }

        let registry = self.lock();
        if registry.find_event(num).is_none() {
            return Err(SdeiError::InvalidParameters);
        }
        let kske = match registry.find_kvm_event(num) {
            Some(kske) => kske,
            None => return Ok(SdeiEventStatus::empty().bits()),
        };

        let index = kske.slot(vcpu.idx());
        let mut status = SdeiEventStatus::empty();
        status.set(SdeiEventStatus::REGISTERED, kske.is_registered(index));
        status.set(SdeiEventStatus::ENABLED, kske.is_enabled(index));
        status.set(SdeiEventStatus::RUNNING, vcpu.is_running(num));
        Ok(status.bits())
    }

    /// EVENT_GET_INFO.
    pub fn event_info(&self, num: u64, info: u64) -> SdeiResult {
        if !kvm_sdei_is_valid_event_num(num) {
            return Err(SdeiError::InvalidParameters);
        }

        let registry = self.lock();
        let kse = registry
            .find_event(num)
            .ok_or(SdeiError::InvalidParameters)?;
        let state = kse.state();

        match info {
            SDEI_EVENT_INFO_EV_TYPE => Ok(state.type_ as u64),
            SDEI_EVENT_INFO_EV_SIGNALED => Ok(state.signaled as u64),
            SDEI_EVENT_INFO_EV_PRIORITY => Ok(state.priority as u64),
            SDEI_EVENT_INFO_EV_ROUTING_MODE | SDEI_EVENT_INFO_EV_ROUTING_AFF => {
                if kse.is_private() {
                    return Err(SdeiError::InvalidParameters);
                }
                let kske = registry.find_kvm_event(num);
                if info == SDEI_EVENT_INFO_EV_ROUTING_MODE {
                    Ok(kske.map_or(SDEI_EVENT_REGISTER_RM_ANY, |e| e.route_mode() as u64))
                } else {
                    Ok(kske.map_or(0, |e| e.route_affinity()))
                }
            }
            _ => Err(SdeiError::InvalidParameters),
        }
    }

    /// EVENT_ROUTING_SET. Only shared events that are registered, disabled
    /// and idle can be rerouted.
    pub fn event_routing_set(&self, num: u64, mode: u64, affinity: u64) -> SdeiResult {
        if !kvm_sdei_is_valid_event_num(num) || !is_valid_route_mode(mode) {
            return Err(SdeiError::InvalidParameters);
        }

        let registry = self.lock();
        let kse = registry
            .find_event(num)
            .ok_or(SdeiError::InvalidParameters)?;
        if kse.is_private() {
            return Err(SdeiError::InvalidParameters);
        }

        let kske = registry.find_kvm_event(num).ok_or(SdeiError::Denied)?;
        if !kske.is_registered(0) || kske.is_enabled(0) || kske.refcount() != 0 {
            return Err(SdeiError::Denied);
        }

        kske.set_route(mode as u8, affinity);
        Ok(SDEI_SUCCESS)
    }

    /// PRIVATE_RESET and SHARED_RESET: unregisters every event of the type
    /// bound by the calling vCPU.
    pub fn reset(&self, vcpu: &SdeiVcpu, private: bool) -> SdeiResult {
        let mut registry = self.lock();
        let bound: Vec<Arc<SdeiKvmEvent>> = registry
            .kvm_events
            .iter()
            .filter(|kske| kske.event().is_private() == private)
            .cloned()
            .collect();

        for kske in bound {
            let index = kske.slot(vcpu.idx());
            if kske.is_registered(index) && registry.unregister_slot(vcpu, &kske, index) {
                debug!(
                    "vcpu {}: SDEI event {:#x} reset pending",
                    vcpu.idx(),
                    kske.num()
                );
            }
        }

        Ok(SDEI_SUCCESS)
    }
}

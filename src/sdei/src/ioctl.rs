// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::defs::is_valid_route_mode;
use crate::event::SdeiKvmEvent;
use crate::registry::SdeiKvm;
use crate::uapi::*;
use crate::vcpu::SdeiVcpu;
use crate::{Error, Result};

impl SdeiKvm {
    /// VM wide admin commands.
    pub fn vm_ioctl(&self, cmd: &mut KvmSdeiCmd) -> Result<()> {
        let ret = match cmd.cmd {
            KVM_SDEI_CMD_GET_VERSION => {
                cmd.version = KVM_SDEI_VERSION;
                Ok(())
            }
            KVM_SDEI_CMD_SET_EVENT => self.lock().add_event(cmd.kse_state),
            KVM_SDEI_CMD_GET_KEVENT_COUNT => {
                cmd.count = self.kvm_event_count() as u32;
                Ok(())
            }
            KVM_SDEI_CMD_GET_KEVENT => self.get_kevent(cmd),
            KVM_SDEI_CMD_SET_KEVENT => self.set_kevent(&cmd.kske_state),
            _ => Err(Error::UnknownCommand(cmd.cmd)),
        };

        if let Err(e) = &ret {
            warn!("SDEI VM command {} failed: {e}", cmd.cmd);
        }
        ret
    }

    /// Walks the bound events: `num` set to the invalid number returns the
    /// first one, otherwise the one following `num`.
    fn get_kevent(&self, cmd: &mut KvmSdeiCmd) -> Result<()> {
        let registry = self.lock();
        let kvm_events = registry.kvm_events();

        let next = if cmd.num == KVM_SDEI_INVALID_NUM {
            0
        } else {
            kvm_events
                .iter()
                .position(|kske| kske.num() == cmd.num)
                .ok_or(Error::EventNotBound(cmd.num))?
                + 1
        };

        let kske = kvm_events.get(next).ok_or(Error::NoMoreEvents)?;
        cmd.kske_state = kske.state();
        cmd.num = kske.num();
        Ok(())
    }

    /// Recreates a bound event saved from another VM.
    fn set_kevent(&self, state: &SdeiKvmEventState) -> Result<()> {
        if !kvm_sdei_is_valid_event_num(state.num) {
            return Err(Error::InvalidEventNumber(state.num));
        }

        let mut registry = self.lock();
        let kse = registry
            .find_event(state.num)
            .cloned()
            .ok_or(Error::UndefinedEvent(state.num))?;
        if registry.find_kvm_event(state.num).is_some() {
            return Err(Error::EventExists(state.num));
        }

        // A bound event always has at least one registered slot.
        let unregistered = state.registered.iter().all(|registered| *registered == 0);
        let enabled_only = state
            .enabled
            .iter()
            .zip(state.registered.iter())
            .any(|(enabled, registered)| enabled & !registered != 0);
        if unregistered
            || enabled_only
            || state.refcount != 0
            || !is_valid_route_mode(state.route_mode as u64)
        {
            return Err(Error::InvalidState);
        }

        let kske = SdeiKvmEvent::from_state(kse, state).ok_or(Error::OutOfMemory)?;
        registry.add_kvm_event(Arc::new(kske))
    }
}

impl SdeiVcpu {
    /// Per vCPU admin commands.
    pub fn vcpu_ioctl(&self, kvm: &SdeiKvm, cmd: &mut KvmSdeiCmd) -> Result<()> {
        let ret = match cmd.cmd {
            KVM_SDEI_CMD_GET_VCPU_STATE => {
                cmd.vcpu_state = self.get_state();
                Ok(())
            }
            KVM_SDEI_CMD_SET_VCPU_STATE => self.set_state(&cmd.vcpu_state),
            KVM_SDEI_CMD_INJECT_EVENT => self.inject(kvm, cmd.num, false),
            _ => Err(Error::UnknownCommand(cmd.cmd)),
        };

        if let Err(e) = &ret {
            warn!("vcpu {}: SDEI command {} failed: {e}", self.idx(), cmd.cmd);
        }
        ret
    }
}

// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fixed layout structures exchanged with userspace to save, restore and
//! inspect the SDEI state of a VM.

pub const KVM_SDEI_MAX_VCPUS: usize = 512;
pub const KVM_SDEI_BITMAP_WORDS: usize = KVM_SDEI_MAX_VCPUS / 64;
pub const KVM_SDEI_INVALID_NUM: u64 = 0;
pub const KVM_SDEI_DEFAULT_NUM: u64 = 0x4040_0000;

/// Number of general purpose registers saved while a handler runs.
pub const KVM_SDEI_SAVED_REGS: usize = 18;

pub const KVM_SDEI_EVENT_NUM_TYPE_SHIFT: u64 = 22;
pub const KVM_SDEI_EVENT_NUM_TYPE_MASK: u64 = 3 << KVM_SDEI_EVENT_NUM_TYPE_SHIFT;
pub const KVM_SDEI_EVENT_NUM_TYPE_PHYS: u64 = 0;
pub const KVM_SDEI_EVENT_NUM_TYPE_VIRT: u64 = 1;

pub fn kvm_sdei_num_type(num: u64) -> u64 {
    (num & KVM_SDEI_EVENT_NUM_TYPE_MASK) >> KVM_SDEI_EVENT_NUM_TYPE_SHIFT
}

/// Event numbers are 32 bits wide and only the virtual namespace is emulated.
pub fn kvm_sdei_is_valid_event_num(num: u64) -> bool {
    (num >> 32) == 0 && kvm_sdei_num_type(num) == KVM_SDEI_EVENT_NUM_TYPE_VIRT
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SdeiEventState {
    pub num: u64,
    pub type_: u8,
    pub signaled: u8,
    pub priority: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdeiKvmEventState {
    pub num: u64,
    pub refcount: u32,
    pub route_mode: u8,
    pub route_affinity: u64,
    pub entries: [u64; KVM_SDEI_MAX_VCPUS],
    pub params: [u64; KVM_SDEI_MAX_VCPUS],
    pub registered: [u64; KVM_SDEI_BITMAP_WORDS],
    pub enabled: [u64; KVM_SDEI_BITMAP_WORDS],
}

impl Default for SdeiKvmEventState {
    fn default() -> Self {
        SdeiKvmEventState {
            num: KVM_SDEI_INVALID_NUM,
            refcount: 0,
            route_mode: 0,
            route_affinity: 0,
            entries: [0; KVM_SDEI_MAX_VCPUS],
            params: [0; KVM_SDEI_MAX_VCPUS],
            registered: [0; KVM_SDEI_BITMAP_WORDS],
            enabled: [0; KVM_SDEI_BITMAP_WORDS],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SdeiVcpuRegs {
    pub regs: [u64; KVM_SDEI_SAVED_REGS],
    pub pc: u64,
    pub pstate: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdeiVcpuState {
    pub masked: u8,
    pub critical_num: u64,
    pub normal_num: u64,
    pub critical_regs: SdeiVcpuRegs,
    pub normal_regs: SdeiVcpuRegs,
}

impl Default for SdeiVcpuState {
    /// vCPUs come up with event delivery masked.
    fn default() -> Self {
        SdeiVcpuState {
            masked: 1,
            critical_num: KVM_SDEI_INVALID_NUM,
            normal_num: KVM_SDEI_INVALID_NUM,
            critical_regs: SdeiVcpuRegs::default(),
            normal_regs: SdeiVcpuRegs::default(),
        }
    }
}

pub const KVM_SDEI_VERSION: u32 = 0x010000;

pub const KVM_SDEI_CMD_GET_VERSION: u32 = 0;
pub const KVM_SDEI_CMD_SET_EVENT: u32 = 1;
pub const KVM_SDEI_CMD_GET_KEVENT_COUNT: u32 = 2;
pub const KVM_SDEI_CMD_GET_KEVENT: u32 = 3;
pub const KVM_SDEI_CMD_SET_KEVENT: u32 = 4;
pub const KVM_SDEI_CMD_GET_VCPU_STATE: u32 = 5;
pub const KVM_SDEI_CMD_SET_VCPU_STATE: u32 = 6;
pub const KVM_SDEI_CMD_INJECT_EVENT: u32 = 7;

/// Argument of the SDEI VM and vCPU ioctls. `cmd` selects which of the
/// remaining fields are read or filled in.
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvmSdeiCmd {
    pub cmd: u32,
    pub version: u32,
    pub count: u32,
    pub num: u64,
    pub kse_state: SdeiEventState,
    pub kske_state: SdeiKvmEventState,
    pub vcpu_state: SdeiVcpuState,
}

impl KvmSdeiCmd {
    pub fn new(cmd: u32) -> Self {
        KvmSdeiCmd {
            cmd,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_num_namespace() {
        assert!(kvm_sdei_is_valid_event_num(KVM_SDEI_DEFAULT_NUM));
        assert!(kvm_sdei_is_valid_event_num(0x0040_0001));
        // Physical namespace.
        assert!(!kvm_sdei_is_valid_event_num(0x4000_0000));
        // Wider than 32 bits.
        assert!(!kvm_sdei_is_valid_event_num(0x1_4040_0000));
        assert!(!kvm_sdei_is_valid_event_num(KVM_SDEI_INVALID_NUM));
        assert_eq!(kvm_sdei_num_type(0x00c0_0000), 3);
    }

    #[test]
    fn test_default_state() {
        let state = SdeiVcpuState::default();
        assert_eq!(state.masked, 1);
        assert_eq!(state.critical_num, KVM_SDEI_INVALID_NUM);

        let cmd = KvmSdeiCmd::new(KVM_SDEI_CMD_GET_KEVENT);
        assert_eq!(cmd.cmd, KVM_SDEI_CMD_GET_KEVENT);
        assert_eq!(cmd.kske_state.registered, [0; KVM_SDEI_BITMAP_WORDS]);
    }
}

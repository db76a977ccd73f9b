// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Guest visible SDEI v1.0 ABI.

use std::result;

use arch::aarch64::smccc::{
    call_val, ARM_SMCCC_FAST_CALL, ARM_SMCCC_OWNER_STANDARD, ARM_SMCCC_SMC_64,
};
use bitflags::bitflags;

const fn sdei_1_0_fn(n: u32) -> u32 {
    call_val(
        ARM_SMCCC_FAST_CALL,
        ARM_SMCCC_SMC_64,
        ARM_SMCCC_OWNER_STANDARD,
        n,
    )
}

pub const SDEI_1_0_FN_BASE: u32 = sdei_1_0_fn(0x20);
pub const SDEI_1_0_FN_LAST: u32 = sdei_1_0_fn(0x3f);

pub const SDEI_1_0_FN_SDEI_VERSION: u32 = sdei_1_0_fn(0x20);
pub const SDEI_1_0_FN_SDEI_EVENT_REGISTER: u32 = sdei_1_0_fn(0x21);
pub const SDEI_1_0_FN_SDEI_EVENT_ENABLE: u32 = sdei_1_0_fn(0x22);
pub const SDEI_1_0_FN_SDEI_EVENT_DISABLE: u32 = sdei_1_0_fn(0x23);
pub const SDEI_1_0_FN_SDEI_EVENT_CONTEXT: u32 = sdei_1_0_fn(0x24);
pub const SDEI_1_0_FN_SDEI_EVENT_COMPLETE: u32 = sdei_1_0_fn(0x25);
pub const SDEI_1_0_FN_SDEI_EVENT_COMPLETE_AND_RESUME: u32 = sdei_1_0_fn(0x26);
pub const SDEI_1_0_FN_SDEI_EVENT_UNREGISTER: u32 = sdei_1_0_fn(0x27);
pub const SDEI_1_0_FN_SDEI_EVENT_STATUS: u32 = sdei_1_0_fn(0x28);
pub const SDEI_1_0_FN_SDEI_EVENT_GET_INFO: u32 = sdei_1_0_fn(0x29);
pub const SDEI_1_0_FN_SDEI_EVENT_ROUTING_SET: u32 = sdei_1_0_fn(0x2a);
pub const SDEI_1_0_FN_SDEI_PE_MASK: u32 = sdei_1_0_fn(0x2b);
pub const SDEI_1_0_FN_SDEI_PE_UNMASK: u32 = sdei_1_0_fn(0x2c);
pub const SDEI_1_0_FN_SDEI_INTERRUPT_BIND: u32 = sdei_1_0_fn(0x2d);
pub const SDEI_1_0_FN_SDEI_INTERRUPT_RELEASE: u32 = sdei_1_0_fn(0x2e);
pub const SDEI_1_0_FN_SDEI_PRIVATE_RESET: u32 = sdei_1_0_fn(0x2f);
pub const SDEI_1_0_FN_SDEI_SHARED_RESET: u32 = sdei_1_0_fn(0x30);
pub const SDEI_1_1_FN_SDEI_EVENT_SIGNAL: u32 = sdei_1_0_fn(0x31);
pub const SDEI_1_1_FN_SDEI_FEATURES: u32 = sdei_1_0_fn(0x32);

pub const SDEI_VERSION_MAJOR_SHIFT: u64 = 48;
pub const SDEI_VERSION_MAJOR_MASK: u64 = 0x7fff;
pub const SDEI_VERSION_MINOR_SHIFT: u64 = 32;
pub const SDEI_VERSION_MINOR_MASK: u64 = 0xffff;
pub const SDEI_VERSION_VENDOR_SHIFT: u64 = 0;
pub const SDEI_VERSION_VENDOR_MASK: u64 = 0xffff_ffff;

pub const fn sdei_version(major: u64, minor: u64, vendor: u64) -> u64 {
    ((major & SDEI_VERSION_MAJOR_MASK) << SDEI_VERSION_MAJOR_SHIFT)
        | ((minor & SDEI_VERSION_MINOR_MASK) << SDEI_VERSION_MINOR_SHIFT)
        | ((vendor & SDEI_VERSION_VENDOR_MASK) << SDEI_VERSION_VENDOR_SHIFT)
}

/// Version reported to the guest: SDEI v1.0, no vendor extensions.
pub const SDEI_IMPLEMENTED_VERSION: u64 = sdei_version(1, 0, 0);

pub const SDEI_SUCCESS: u64 = 0;

pub const SDEI_EVENT_TYPE_SHARED: u8 = 0;
pub const SDEI_EVENT_TYPE_PRIVATE: u8 = 1;

pub const SDEI_EVENT_PRIORITY_NORMAL: u8 = 0;
pub const SDEI_EVENT_PRIORITY_CRITICAL: u8 = 1;

pub const SDEI_EVENT_REGISTER_RM_ANY: u64 = 0;
pub const SDEI_EVENT_REGISTER_RM_PE: u64 = 1;

pub const SDEI_EVENT_INFO_EV_TYPE: u64 = 0;
pub const SDEI_EVENT_INFO_EV_SIGNALED: u64 = 1;
pub const SDEI_EVENT_INFO_EV_PRIORITY: u64 = 2;
pub const SDEI_EVENT_INFO_EV_ROUTING_MODE: u64 = 3;
pub const SDEI_EVENT_INFO_EV_ROUTING_AFF: u64 = 4;

pub fn is_valid_route_mode(mode: u64) -> bool {
    mode == SDEI_EVENT_REGISTER_RM_ANY || mode == SDEI_EVENT_REGISTER_RM_PE
}

bitflags! {
    /// Result of EVENT_STATUS.
    pub struct SdeiEventStatus: u64 {
        const REGISTERED = 1 << 0;
        const ENABLED = 1 << 1;
        const RUNNING = 1 << 2;
    }
}

/// Failure codes returned to the guest in x0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdeiError {
    NotSupported,
    InvalidParameters,
    Denied,
    Pending,
    OutOfResource,
}

impl SdeiError {
    pub fn code(self) -> i64 {
        match self {
            SdeiError::NotSupported => -1,
            SdeiError::InvalidParameters => -2,
            SdeiError::Denied => -3,
            SdeiError::Pending => -5,
            SdeiError::OutOfResource => -10,
        }
    }

    /// Value as written into a 64 bit guest register.
    pub fn to_reg(self) -> u64 {
        self.code() as u64
    }
}

/// Outcome of a guest SDEI call: the value for x0 or a failure code.
pub type SdeiResult = result::Result<u64, SdeiError>;

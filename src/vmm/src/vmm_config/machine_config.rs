// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Display, Formatter, Result};

use arch::aarch64::layout::DRAM_MEM_MAX_SIZE;
use sdei::uapi::{kvm_sdei_is_valid_event_num, SdeiEventState, KVM_SDEI_MAX_VCPUS};
use sdei::{DEFAULT_EVENTS, SDEI_EVENT_PRIORITY_CRITICAL, SDEI_EVENT_TYPE_PRIVATE};

/// Default guest memory size, in MiB.
pub const DEFAULT_MEM_SIZE_MIB: usize = 128;

/// Errors associated with configuring the VM.
#[derive(Debug, PartialEq, Eq)]
pub enum VmConfigError {
    /// The memory size is invalid.
    InvalidMemorySize(usize),
    /// The vcpu count is invalid.
    InvalidVcpuCount(u16),
    /// An event in the SDEI table is invalid or defined twice.
    InvalidSdeiEvent(u64),
}

impl Display for VmConfigError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        use self::VmConfigError::*;
        match *self {
            InvalidMemorySize(size) => write!(f, "The memory size (MiB) is invalid: {size}"),
            InvalidVcpuCount(count) => write!(
                f,
                "The vcpu count is invalid: {count}. It must be between 1 and {KVM_SDEI_MAX_VCPUS}"
            ),
            InvalidSdeiEvent(num) => write!(f, "Invalid SDEI event definition: {num:#x}"),
        }
    }
}

/// Strongly typed data structure used to configure the VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of vcpus.
    pub vcpu_count: u16,
    /// Guest memory size, in MiB, starting at the DRAM base.
    pub mem_size_mib: usize,
    /// Whether SDEI is offered to the guest.
    pub sdei: bool,
    /// Firmware events every VM starts with.
    pub sdei_events: Vec<SdeiEventState>,
    /// Whether an in-kernel interrupt controller is present.
    pub irqchip: bool,
    /// Whether paravirtualized asynchronous page faults are offered.
    pub async_pf: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            vcpu_count: 1,
            mem_size_mib: DEFAULT_MEM_SIZE_MIB,
            sdei: true,
            sdei_events: DEFAULT_EVENTS.to_vec(),
            irqchip: true,
            async_pf: true,
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> std::result::Result<(), VmConfigError> {
        if self.vcpu_count == 0 || usize::from(self.vcpu_count) > KVM_SDEI_MAX_VCPUS {
            return Err(VmConfigError::InvalidVcpuCount(self.vcpu_count));
        }

        match self.mem_size_mib.checked_mul(1 << 20) {
            Some(size) if size != 0 && size as u64 <= DRAM_MEM_MAX_SIZE => (),
            _ => return Err(VmConfigError::InvalidMemorySize(self.mem_size_mib)),
        }

        if self.sdei {
            for (i, event) in self.sdei_events.iter().enumerate() {
                let duplicate = self.sdei_events[..i].iter().any(|e| e.num == event.num);
                if duplicate
                    || !kvm_sdei_is_valid_event_num(event.num)
                    || event.type_ > SDEI_EVENT_TYPE_PRIVATE
                    || event.priority > SDEI_EVENT_PRIORITY_CRITICAL
                {
                    return Err(VmConfigError::InvalidSdeiEvent(event.num));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sdei_events.len(), 1);
    }

    #[test]
    fn test_validate() {
        let mut config = VmConfig {
            vcpu_count: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(VmConfigError::InvalidVcpuCount(0)));
        config.vcpu_count = KVM_SDEI_MAX_VCPUS as u16 + 1;
        assert!(matches!(
            config.validate(),
            Err(VmConfigError::InvalidVcpuCount(_))
        ));
        config.vcpu_count = 2;

        config.mem_size_mib = 0;
        assert_eq!(config.validate(), Err(VmConfigError::InvalidMemorySize(0)));
        config.mem_size_mib = DEFAULT_MEM_SIZE_MIB;

        config.sdei_events.push(DEFAULT_EVENTS[0]);
        assert_eq!(
            config.validate(),
            Err(VmConfigError::InvalidSdeiEvent(DEFAULT_EVENTS[0].num))
        );
        // The table is ignored without SDEI.
        config.sdei = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            VmConfigError::InvalidSdeiEvent(0x4040_0000).to_string(),
            "Invalid SDEI event definition: 0x40400000"
        );
        assert_eq!(
            VmConfigError::InvalidMemorySize(0).to_string(),
            "The memory size (MiB) is invalid: 0"
        );
    }
}

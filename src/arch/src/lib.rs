// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Architecture specific definitions shared by the SDEI and asynchronous
//! page fault emulation. Only aarch64 guests are supported.

/// Module for aarch64 related functionality.
pub mod aarch64;

pub use aarch64::regs::VcpuRegs;

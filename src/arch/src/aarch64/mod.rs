// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Exception syndrome decoding.
pub mod esr;
/// Guest physical memory layout.
pub mod layout;
/// Guest visible core registers.
pub mod regs;
/// SMC Calling Convention helpers.
pub mod smccc;

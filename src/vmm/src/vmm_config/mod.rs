// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Wrapper for configuring the memory, CPUs and firmware services of the VM.
pub mod machine_config;

pub use machine_config::{VmConfig, VmConfigError};

// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Constants and configuration shared between the in-process collector side
//! and the post-mortem reader side.

pub mod configuration;
pub mod constants;

// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

pub mod timeout;
pub mod unix_utils;

// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! The fixed binary dump format and its readers: `buffer` holds the
//! explicit-offset codec shared by writer and reader, `report` renders a
//! validated dump into the human-readable text artifact.

pub mod buffer;
pub mod report;

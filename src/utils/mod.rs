// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Utility modules

pub mod names;

pub use names::safe_job_name;

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identity primitives: GUIDs and the entity registry that allocates them.

pub mod guid;
pub mod registry;

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Folder placement: context snapshot, response parsing and path anchoring

pub mod context;
pub mod normalize;
pub mod parse;
pub mod planner;

pub use context::{ContextBuilder, PlacementContext};
pub use planner::{resolve, PathPlanner, PlacementDecision, PlacementReason};

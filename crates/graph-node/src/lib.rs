// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Graph-node driver: admin RPC and indexing-status operations, plus the
//! higher-level `ensure`/auto-graft/`sync_to_block` primitives reconciliation
//! builds on.

pub mod client;
pub mod ensure;

pub use client::{
    AssignmentStatus, BlockPointer, ChainStatus, DeploymentAssignment, GraphNodeClient,
    IndexingStatus,
};
pub use ensure::{sync_to_block, GraphNodeDriver};

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only utilities for kvfs core
//!
//! Decorators around metadata stores that let tests inject failures and
//! observe how often the tree engine touches the store.

#[cfg(test)]
pub mod mock_store;

// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod call_data;
pub mod executor;
pub mod filter;

pub use call_data::{ProxySCCompleteCallData, CallData};
pub use executor::ScCallExecutor;
pub use filter::PendingOperationFilter;

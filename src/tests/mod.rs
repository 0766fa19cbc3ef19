// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Integration Tests
//!
//! Scenarios spanning several subsystems: the kernel booted on mock
//! hardware, and RPC entrypoints served by host threads on top of it.

mod rpc_tests;

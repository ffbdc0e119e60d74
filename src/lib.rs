// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! `reactorcore` is the per-worker concurrency core for an nginx-style
//! HTTP reverse proxy: a single-threaded reactor, a pooled connection
//! table with idle reuse and a background reaper, a per-IP connection
//! and rate limiter, a thread pool for blocking work, and the signal-
//! driven lifecycle that ties them together into one worker process.
//!
//! What this crate does *not* do: parse HTTP, generate responses, select
//! an upstream, or terminate TLS. Those belong to a protocol layer built
//! on top, plugged in through [`worker::RequestHandler`].
//!
//! ## Layout
//!
//! - [`event_loop`] — readiness multiplexing (`mio`-backed).
//! - [`connection`] — per-connection FSM and buffers.
//! - [`pool`] — connection lifecycle, idle reuse, reaping.
//! - [`limiter`] — per-IP connection and rate limits.
//! - [`thread_pool`] — bounded FIFO of blocking work.
//! - [`worker`] — wires the above into a running worker process.
//! - [`config`] — plain configuration structs (no parsing).
//! - [`error`] — error enums for each component.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod limiter;
pub mod net;
pub mod pool;
pub mod thread_pool;
pub mod worker;

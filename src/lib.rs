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

//! `tcpherder` is the per-CPU connection dispatch and readiness-notification
//! core of a TCP front-end load balancer.
//!
//! A [`HerderList`] owns one [`Herder`](herder::Herder) per CPU. Each Herder
//! shards live connections, watches them with its own from-scratch
//! level-triggered [`ReadinessEngine`](engine::ReadinessEngine), and hands
//! ready connections off to a shared worker pool for request processing.
//!
//! HTTP parsing, generic socket I/O, and the worker pool's own request
//! handling are out of scope here; they are consumed through the
//! [`Socket`](socket::Socket) and [`WorkerPool`](worker_pool::WorkerPool)
//! traits.

mod config;
mod connection;
mod dispatch;
mod engine;
mod error;
mod event_item;
mod herder;
mod herder_list;
mod mask;
mod pool_registry;
/// The external TCP-socket collaborator interface.
pub mod socket;
/// The external Worker Pool collaborator interface.
pub mod worker_pool;

pub use config::HerderConfig;
pub use connection::ConnectionRecord;
pub use dispatch::dispatch;
pub use error::HerderError;
pub use herder::Herder;
pub use herder_list::{destroy_pool, init_pool, HerderList};
pub use mask::EventMask;
pub use socket::{RemoteEndpoint, Socket};
pub use worker_pool::{EventJob, WorkerPool};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HerderError>;

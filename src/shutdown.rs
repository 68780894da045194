// Copyright 2024 Felix Engl
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

//! Cooperative cancellation, shared by every long-running subsystem (§5).

use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A cloneable cancellation signal. Every subsystem that can block for a
/// meaningful amount of time (the writer task, the parallel parser, a cache
/// sync) takes one of these and checks it at its suspension points.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// A token scoped to this signal, for use with `tokio::select!`.
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }

    fn sender(&self) -> ShutdownSignal {
        ShutdownSignal {
            token: self.token.clone(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// The write half of a [`Shutdown`]. Held by `AppContext` only; every other
/// collaborator gets a read-only [`Shutdown`].
#[derive(Debug)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Creates a linked `(signal, receiver)` pair for wiring into `AppContext`.
pub fn shutdown_pair() -> (ShutdownSignal, Shutdown) {
    let shutdown = Shutdown::new();
    (shutdown.sender(), shutdown)
}

/// A guard that keeps a resource alive until dropped; cancels its token on
/// drop so a forgotten background task is still told to stop.
#[derive(Clone, Debug)]
pub struct ShutdownGuard {
    _guard: Arc<DropGuard>,
}

impl ShutdownGuard {
    pub fn new(shutdown: &Shutdown) -> Self {
        Self {
            _guard: Arc::new(shutdown.token.clone().drop_guard()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (signal, shutdown) = shutdown_pair();
        assert!(!shutdown.is_shutdown());
        signal.cancel();
        shutdown.wait().await;
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn child_token_observes_parent_cancellation() {
        let (signal, shutdown) = shutdown_pair();
        let child = shutdown.child();
        signal.cancel();
        assert!(child.is_cancelled());
    }
}

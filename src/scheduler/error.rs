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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to build the cron job scheduler: {0}")]
    Init(#[source] tokio_cron_scheduler::JobSchedulerError),
    #[error("invalid cron expression '{expr}' for provider '{provider}': {source}")]
    InvalidCron {
        provider: String,
        expr: String,
        #[source]
        source: tokio_cron_scheduler::JobSchedulerError,
    },
    #[error("failed to register job for provider '{provider}': {source}")]
    Register {
        provider: String,
        #[source]
        source: tokio_cron_scheduler::JobSchedulerError,
    },
    #[error("failed to start the cron job scheduler: {0}")]
    Start(#[source] tokio_cron_scheduler::JobSchedulerError),
    #[error("failed to shut down the cron job scheduler: {0}")]
    Shutdown(#[source] tokio_cron_scheduler::JobSchedulerError),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error(transparent)]
    ProcessManager(#[from] crate::process_manager::ProcessManagerError),
}

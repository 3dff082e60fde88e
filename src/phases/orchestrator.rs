//! Sequential phase execution with bounded per-host fan-out

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Ordering, Phase, PhaseFailure, RunStatus, TaskContext};
use crate::crd::HostConfig;
use crate::retry::{retry_if, RetryPolicy};
use crate::ssh::Connector;
use crate::state::{State, TaskOutput};
use crate::Error;

/// Default number of hosts worked on at once
pub const DEFAULT_CONCURRENCY: usize = 10;

type Slot = Option<Result<TaskOutput, Error>>;

enum PhaseStop {
    Failed(PhaseFailure),
    Cancelled,
}

/// Runs phases against hosts reached through a [`Connector`]
pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Orchestrator {
    /// Orchestrator with the default retry policy and concurrency
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Use the given retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Work on at most `concurrency` hosts at once (minimum 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run `phases` in order
    ///
    /// Stops at the first failed phase. Cancellation is honored before each
    /// phase and before each host starts; commands already running are
    /// allowed to finish.
    pub async fn run(
        &self,
        state: &mut State,
        phases: &[Phase],
        cancel: &CancellationToken,
    ) -> RunStatus {
        for phase in phases {
            if cancel.is_cancelled() {
                info!(phase = %phase.name, "Run cancelled before phase");
                return RunStatus::Cancelled {
                    phase: phase.name.clone(),
                };
            }

            match self.run_phase(state, phase, cancel).await {
                Ok(()) => {}
                Err(PhaseStop::Failed(failure)) => return RunStatus::Failed(failure),
                Err(PhaseStop::Cancelled) => {
                    info!(phase = %phase.name, "Run cancelled during phase");
                    return RunStatus::Cancelled {
                        phase: phase.name.clone(),
                    };
                }
            }
        }
        RunStatus::Succeeded
    }

    async fn run_phase(
        &self,
        state: &mut State,
        phase: &Phase,
        cancel: &CancellationToken,
    ) -> Result<(), PhaseStop> {
        let spec = Arc::clone(&state.spec);
        let hosts = phase.selector.select(&spec);
        if hosts.is_empty() {
            debug!(phase = %phase.name, "No hosts selected, skipping phase");
            return Ok(());
        }

        info!(
            phase = %phase.name,
            hosts = hosts.len(),
            ordering = ?phase.ordering,
            "Starting phase"
        );

        // Cancelled by the first fatal host failure so pending hosts never start
        let phase_token = cancel.child_token();
        let mut slots: Vec<Slot> = hosts.iter().map(|_| None).collect();

        {
            let shared: &State = state;
            match phase.ordering {
                Ordering::Parallel => {
                    self.fan_out(shared, phase, &hosts, &mut slots, self.concurrency, &phase_token)
                        .await;
                }
                Ordering::LeaderFirst => {
                    let (first, rest) = slots.split_at_mut(1);
                    self.fan_out(shared, phase, &hosts[..1], first, 1, &phase_token)
                        .await;
                    self.fan_out(shared, phase, &hosts[1..], rest, self.concurrency, &phase_token)
                        .await;
                }
                Ordering::Serial => {
                    self.fan_out(shared, phase, &hosts, &mut slots, 1, &phase_token)
                        .await;
                }
            }
        }

        let mut outputs = Vec::with_capacity(slots.len());
        let mut failures = Vec::new();
        let mut not_started = 0usize;
        for (host, slot) in hosts.iter().zip(slots) {
            match slot {
                Some(Ok(output)) => outputs.push((host.id, output)),
                Some(Err(e)) => failures.push((*host, e)),
                None => not_started += 1,
            }
        }

        if !failures.is_empty() {
            if phase.best_effort {
                for (host, e) in &failures {
                    warn!(
                        phase = %phase.name,
                        host = %host.display_name(),
                        error = %e,
                        "Best-effort phase failed on host"
                    );
                }
                commit(state, phase, outputs);
                return Ok(());
            }
            return Err(PhaseStop::Failed(into_failure(phase, failures)));
        }

        if not_started > 0 {
            debug!(phase = %phase.name, not_started, "Hosts skipped after cancellation");
            return Err(PhaseStop::Cancelled);
        }

        commit(state, phase, outputs);

        if let Err(error) = phase.task.finalize(state).await {
            return Err(PhaseStop::Failed(PhaseFailure {
                phase: phase.name.clone(),
                host_id: None,
                host: None,
                failed_hosts: Vec::new(),
                error,
            }));
        }

        info!(phase = %phase.name, "Phase completed");
        Ok(())
    }

    async fn fan_out(
        &self,
        state: &State,
        phase: &Phase,
        hosts: &[&HostConfig],
        slots: &mut [Slot],
        limit: usize,
        token: &CancellationToken,
    ) {
        futures::stream::iter(hosts.iter().zip(slots.iter_mut()))
            .for_each_concurrent(Some(limit), |(host, slot)| async move {
                if token.is_cancelled() {
                    debug!(phase = %phase.name, host = %host.display_name(), "Not starting host");
                    return;
                }
                let result = self.run_on_host(state, phase, host, token).await;
                if result.is_err() && !phase.best_effort {
                    token.cancel();
                }
                *slot = Some(result);
            })
            .await;
    }

    async fn run_on_host(
        &self,
        state: &State,
        phase: &Phase,
        host: &HostConfig,
        token: &CancellationToken,
    ) -> Result<TaskOutput, Error> {
        let ctx = TaskContext {
            host,
            state,
            phase: &phase.name,
        };
        let retryable = self.retry.retryable;
        let operation = format!("{} on {}", phase.name, host.display_name());

        debug!(phase = %phase.name, host = %host.display_name(), "Running task");
        retry_if(
            &self.retry.config,
            &operation,
            |e: &Error| !token.is_cancelled() && retryable(e),
            || async {
                let exec = self.connector.connect(host).await.map_err(Error::from)?;
                phase.task.run(&ctx, exec.as_ref()).await
            },
        )
        .await
        .map_err(|e| Error::phase(&phase.name, host.id, e))
    }
}

fn commit(state: &mut State, phase: &Phase, outputs: Vec<(usize, TaskOutput)>) {
    for (host_id, output) in outputs {
        state.record(host_id, &phase.name, output);
    }
}

fn into_failure(phase: &Phase, failures: Vec<(&HostConfig, Error)>) -> PhaseFailure {
    let failed_hosts = failures.iter().map(|(h, _)| h.id).collect();
    let mut failures = failures.into_iter();
    // Non-empty: checked by the caller
    let (host, error) = match failures.next() {
        Some((host, error)) => (Some(host), error),
        None => (None, Error::internal("phase failed without a host error")),
    };
    PhaseFailure {
        phase: phase.name.clone(),
        host_id: host.map(|h| h.id),
        host: host.map(|h| h.public_address.clone()),
        failed_hosts,
        error,
    }
}

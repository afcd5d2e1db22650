// Pipeline runner
// Runs fetch → process → convert forever, retrying each step and restarting
// the whole cycle after a cooldown.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, info_span, warn, Instrument};

use crate::clock::{format_wait, Sleeper, TokioSleeper};
use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::{CycleError, StepError, StepResult};
use crate::executor::{ProcessExecutor, StepExecutor};
use crate::pipeline::Step;

/// States of the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    /// About to run a pipeline cycle
    #[default]
    CycleRunning,
    /// The last cycle failed; waiting out the recovery delay
    CooldownAfterFailure,
}

/// The main runner that keeps the pipeline alive
pub struct Runner<E, S = TokioSleeper> {
    config: PipelineConfig,
    executor: E,
    sleeper: S,
    cycles_started: AtomicU64,
}

impl Runner<ProcessExecutor, TokioSleeper> {
    /// Create a runner that spawns real processes and really waits
    pub fn new(config: PipelineConfig) -> Self {
        let executor = ProcessExecutor::from_config(&config);
        Self::with_parts(config, executor, TokioSleeper)
    }
}

impl<E, S> Runner<E, S>
where
    E: StepExecutor,
    S: Sleeper,
{
    /// Create a runner with a custom executor and sleeper
    pub fn with_parts(config: PipelineConfig, executor: E, sleeper: S) -> Self {
        Self {
            config,
            executor,
            sleeper,
            cycles_started: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of cycles started since the runner was created
    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::Relaxed)
    }

    /// Run a step with the configured retry policy
    pub async fn run_step(&self, step: &Step) -> StepResult {
        self.run_step_with(step, &self.config.retry).await
    }

    /// Run a step, retrying failed attempts according to `policy`.
    ///
    /// Returns as soon as one attempt succeeds. When the policy gives up the
    /// last attempt's error comes back wrapped in [`StepError::Exhausted`].
    /// Unexpected failures are returned as-is without retrying.
    pub async fn run_step_with(&self, step: &Step, policy: &RetryPolicy) -> StepResult {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            info!(
                "Running {} (attempt {}/{})",
                step.name(),
                attempt,
                max_attempts
            );

            let err = match self.executor.execute(step).await {
                Ok(()) => {
                    info!("{} completed successfully", step.name());
                    return Ok(());
                }
                Err(err) => err,
            };

            let kind = err.kind();
            if !kind.is_retryable() {
                error!(kind = %kind, "Error running {}: {}", step.name(), err);
                return Err(err);
            }

            if kind.is_launch_failure() {
                warn!(kind = %kind, "Could not start {}: {}", step.name(), err);
            } else {
                warn!(kind = %kind, "Error running {}: {}", step.name(), err);
            }

            if policy.should_retry(attempt, kind) {
                info!("Retrying in {}...", format_wait(policy.delay));
                self.sleeper.sleep(policy.delay).await;
                continue;
            }

            error!("{} failed after {} attempt(s)", step.name(), attempt);
            return Err(StepError::Exhausted {
                step: step.kind,
                attempts: attempt,
                last: Box::new(err),
            });
        }
    }

    /// Run fetch, process and convert once, in order.
    ///
    /// Waits the inter-step delay between steps. The first step that fails
    /// ends the cycle; later steps are not started.
    pub async fn run_cycle(&self) -> Result<(), CycleError> {
        let number = self.cycles_started.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("cycle", number);

        async {
            info!("Starting the pipeline");

            for (index, step) in self.config.pipeline.steps().iter().enumerate() {
                if index > 0 {
                    info!(
                        "Waiting {} for resources to stabilize...",
                        format_wait(self.config.delays.between_steps)
                    );
                    self.sleeper.sleep(self.config.delays.between_steps).await;
                }

                let step_span = info_span!("step", step = step.name(), program = %step.program);
                self.run_step(step)
                    .instrument(step_span)
                    .await
                    .map_err(|source| CycleError::Step {
                        step: step.kind,
                        source,
                    })?;
            }

            Ok::<(), CycleError>(())
        }
        .instrument(span)
        .await
    }

    /// Perform one transition of the outer loop and return the next state.
    ///
    /// `CycleRunning` runs a cycle; success waits the cycle cooldown and stays
    /// in `CycleRunning`, failure moves to `CooldownAfterFailure`.
    /// `CooldownAfterFailure` waits the recovery delay and goes back to
    /// `CycleRunning`.
    pub async fn advance(&self, state: LoopState) -> LoopState {
        match state {
            LoopState::CycleRunning => match self.run_cycle().await {
                Ok(()) => {
                    let cooldown = self.config.delays.cycle_cooldown;
                    let next_run = chrono::Duration::from_std(cooldown)
                        .ok()
                        .and_then(|d| chrono::Local::now().checked_add_signed(d));
                    match next_run {
                        Some(at) => info!(
                            next_run = %at.format("%Y-%m-%d %H:%M:%S"),
                            "All steps executed successfully. Sleeping for {} before the next run",
                            format_wait(cooldown)
                        ),
                        None => info!(
                            "All steps executed successfully. Sleeping for {} before the next run",
                            format_wait(cooldown)
                        ),
                    }
                    self.sleeper.sleep(cooldown).await;
                    LoopState::CycleRunning
                }
                Err(err) => {
                    let CycleError::Step { step, source } = &err;
                    error!(
                        step = %step,
                        exhausted = source.is_exhausted(),
                        "Pipeline encountered an error: {}. Retrying in {}",
                        err,
                        format_wait(self.config.delays.recovery)
                    );
                    LoopState::CooldownAfterFailure
                }
            },
            LoopState::CooldownAfterFailure => {
                self.sleeper.sleep(self.config.delays.recovery).await;
                LoopState::CycleRunning
            }
        }
    }

    /// Keep the pipeline running. Never returns; stop it by dropping the
    /// future or killing the process.
    pub async fn run(&self) {
        let mut state = LoopState::default();
        loop {
            state = self.advance(state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, StepKind};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Executor that replays scripted outcomes per step and records calls.
    #[derive(Default)]
    struct ScriptedExecutor {
        outcomes: Mutex<HashMap<StepKind, VecDeque<bool>>>,
        calls: Mutex<Vec<StepKind>>,
    }

    impl ScriptedExecutor {
        /// Outcomes for `kind`, in call order. Calls past the script succeed.
        fn script(self, kind: StepKind, outcomes: &[bool]) -> Self {
            self.outcomes
                .lock()
                .unwrap()
                .insert(kind, outcomes.iter().copied().collect());
            self
        }

        fn calls(&self) -> Vec<StepKind> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, kind: StepKind) -> usize {
            self.calls().iter().filter(|k| **k == kind).count()
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute(&self, step: &Step) -> StepResult {
            self.calls.lock().unwrap().push(step.kind);
            let ok = self
                .outcomes
                .lock()
                .unwrap()
                .get_mut(&step.kind)
                .and_then(|q| q.pop_front())
                .unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(StepError::exit_status(&step.program, 1))
            }
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        waits: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn waits(&self) -> Vec<Duration> {
            self.waits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
        }
    }

    const RETRY: Duration = Duration::from_secs(1);
    const BETWEEN: Duration = Duration::from_secs(2);
    const COOLDOWN: Duration = Duration::from_secs(3);
    const RECOVERY: Duration = Duration::from_secs(4);

    fn test_config(max_attempts: u32) -> PipelineConfig {
        PipelineConfig::new()
            .with_retry(max_attempts, RETRY)
            .with_between_steps(BETWEEN)
            .with_cycle_cooldown(COOLDOWN)
            .with_recovery_delay(RECOVERY)
    }

    fn runner(
        max_attempts: u32,
        executor: ScriptedExecutor,
    ) -> (
        Runner<Arc<ScriptedExecutor>, Arc<RecordingSleeper>>,
        Arc<ScriptedExecutor>,
        Arc<RecordingSleeper>,
    ) {
        let executor = Arc::new(executor);
        let sleeper = Arc::new(RecordingSleeper::default());
        let runner = Runner::with_parts(
            test_config(max_attempts),
            Arc::clone(&executor),
            Arc::clone(&sleeper),
        );
        (runner, executor, sleeper)
    }

    fn fetch_step() -> Step {
        Pipeline::default().step(StepKind::Fetch).clone()
    }

    #[tokio::test]
    async fn test_run_step_succeeds_first_attempt() {
        let (runner, executor, sleeper) = runner(3, ScriptedExecutor::default());

        runner.run_step(&fetch_step()).await.unwrap();

        assert_eq!(executor.count(StepKind::Fetch), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn test_run_step_fails_twice_then_succeeds() {
        let executor = ScriptedExecutor::default().script(StepKind::Fetch, &[false, false, true]);
        let (runner, executor, sleeper) = runner(3, executor);

        runner.run_step(&fetch_step()).await.unwrap();

        assert_eq!(executor.count(StepKind::Fetch), 3);
        assert_eq!(sleeper.waits(), vec![RETRY, RETRY]);
    }

    #[tokio::test]
    async fn test_run_step_stops_at_first_success() {
        let executor =
            ScriptedExecutor::default().script(StepKind::Fetch, &[false, true, false, false]);
        let (runner, executor, _) = runner(5, executor);

        runner.run_step(&fetch_step()).await.unwrap();

        assert_eq!(executor.count(StepKind::Fetch), 2);
    }

    #[tokio::test]
    async fn test_run_step_exhaustion_propagates() {
        let executor = ScriptedExecutor::default().script(StepKind::Fetch, &[false; 4]);
        let (runner, executor, sleeper) = runner(4, executor);

        let err = runner.run_step(&fetch_step()).await.unwrap_err();

        match err {
            StepError::Exhausted {
                step,
                attempts,
                last,
            } => {
                assert_eq!(step, StepKind::Fetch);
                assert_eq!(attempts, 4);
                assert!(matches!(*last, StepError::ExitStatus { code: 1, .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(executor.count(StepKind::Fetch), 4);
        // No wait after the final attempt
        assert_eq!(sleeper.waits(), vec![RETRY; 3]);
    }

    #[tokio::test]
    async fn test_single_attempt_never_waits() {
        let executor = ScriptedExecutor::default().script(StepKind::Fetch, &[false]);
        let (runner, executor, sleeper) = runner(1, executor);

        assert!(runner.run_step(&fetch_step()).await.is_err());
        assert_eq!(executor.count(StepKind::Fetch), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn test_attempts_bounded_for_all_limits() {
        for max_attempts in 1..=6 {
            let executor = ScriptedExecutor::default().script(StepKind::Fetch, &[false; 10]);
            let (runner, executor, sleeper) = runner(max_attempts, executor);

            assert!(runner.run_step(&fetch_step()).await.is_err());
            assert_eq!(executor.count(StepKind::Fetch), max_attempts as usize);
            assert_eq!(sleeper.waits().len(), max_attempts as usize - 1);
        }
    }

    #[tokio::test]
    async fn test_unexpected_failure_is_not_retried() {
        struct Broken;

        #[async_trait]
        impl StepExecutor for Broken {
            async fn execute(&self, _step: &Step) -> StepResult {
                Err(StepError::unexpected("executor state corrupted"))
            }
        }

        let sleeper = Arc::new(RecordingSleeper::default());
        let runner = Runner::with_parts(test_config(3), Broken, Arc::clone(&sleeper));

        let err = runner.run_step(&fetch_step()).await.unwrap_err();
        assert!(matches!(err, StepError::Unexpected(_)));
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_runs_steps_in_order_with_waits() {
        let (runner, executor, sleeper) = runner(3, ScriptedExecutor::default());

        runner.run_cycle().await.unwrap();

        assert_eq!(executor.calls(), StepKind::ORDER.to_vec());
        assert_eq!(sleeper.waits(), vec![BETWEEN, BETWEEN]);
        assert_eq!(runner.cycles_started(), 1);
    }

    #[tokio::test]
    async fn test_cycle_stops_when_fetch_exhausted() {
        let executor = ScriptedExecutor::default().script(StepKind::Fetch, &[false, false]);
        let (runner, executor, _) = runner(2, executor);

        let err = runner.run_cycle().await.unwrap_err();

        assert_eq!(err.step(), StepKind::Fetch);
        assert_eq!(executor.calls(), vec![StepKind::Fetch, StepKind::Fetch]);
    }

    #[tokio::test]
    async fn test_cycle_never_reaches_convert_when_process_fails() {
        let executor = ScriptedExecutor::default().script(StepKind::Process, &[false, false]);
        let (runner, executor, sleeper) = runner(2, executor);

        let err = runner.run_cycle().await.unwrap_err();

        assert_eq!(err.step(), StepKind::Process);
        assert_eq!(executor.count(StepKind::Convert), 0);
        assert_eq!(
            executor.calls(),
            vec![StepKind::Fetch, StepKind::Process, StepKind::Process]
        );
        assert_eq!(sleeper.waits(), vec![BETWEEN, RETRY]);
    }

    #[tokio::test]
    async fn test_successful_cycle_sleeps_cooldown() {
        let (runner, executor, sleeper) = runner(3, ScriptedExecutor::default());

        let next = runner.advance(LoopState::CycleRunning).await;

        assert_eq!(next, LoopState::CycleRunning);
        assert_eq!(executor.calls().len(), 3);
        assert_eq!(sleeper.waits(), vec![BETWEEN, BETWEEN, COOLDOWN]);
    }

    #[tokio::test]
    async fn test_failed_cycle_moves_to_recovery() {
        let executor = ScriptedExecutor::default().script(StepKind::Convert, &[false]);
        let (runner, _, sleeper) = runner(1, executor);

        let next = runner.advance(LoopState::CycleRunning).await;
        assert_eq!(next, LoopState::CooldownAfterFailure);
        assert_eq!(sleeper.waits(), vec![BETWEEN, BETWEEN]);

        let next = runner.advance(next).await;
        assert_eq!(next, LoopState::CycleRunning);
        assert_eq!(sleeper.waits(), vec![BETWEEN, BETWEEN, RECOVERY]);
    }

    #[tokio::test]
    async fn test_next_cycle_after_cooldown_is_identical() {
        let (runner, executor, _) = runner(3, ScriptedExecutor::default());

        let mut state = LoopState::default();
        state = runner.advance(state).await;
        runner.advance(state).await;

        let mut expected = StepKind::ORDER.to_vec();
        expected.extend(StepKind::ORDER);
        assert_eq!(executor.calls(), expected);
        assert_eq!(runner.cycles_started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_going_after_failures() {
        let executor = ScriptedExecutor::default().script(StepKind::Fetch, &[false; 4]);
        let executor = Arc::new(executor);
        let runner = Runner::with_parts(
            test_config(2),
            Arc::clone(&executor),
            TokioSleeper,
        );

        // Two failed cycles, one recovery each, then a successful one
        let budget = RETRY * 2 + RECOVERY * 2 + BETWEEN * 2 + Duration::from_millis(1);
        let outcome = tokio::time::timeout(budget, runner.run()).await;

        assert!(outcome.is_err(), "run() must not return on its own");
        assert_eq!(runner.cycles_started(), 3);
        assert_eq!(executor.count(StepKind::Convert), 1);
    }
}

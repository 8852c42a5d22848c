use super::super::library::{BoxedError, EmptyResult};
use super::{DeathReason, Heart};
use async_trait::async_trait;
use std::any::type_name;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

/// Executable module
#[async_trait]
pub trait Module {
    /// Executed before running the core loop
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Core run loop of the module
    ///
    /// When the function returns `Some(_)` the death of the returned [`Heart`] is awaited before
    /// calling the shutdown hook. Long running roles which serve requests in the background use
    /// this to hand off their lifecycle management.
    ///
    /// Returning `None` results in the module entering its shutdown state right away.
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError>;

    /// Shutdown hook executed after the core loop has terminated
    #[instrument(skip(self))]
    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if termination_reason.is_clean() {
            info!("Module exited normally")
        } else {
            error!("Module terminated with an error")
        }
    }
}

/// Reason why a module has terminated
#[derive(Error, Debug)]
pub enum ModuleTerminationReason {
    /// Startup routine threw an error
    #[error("startup routine threw an error")]
    StartupFailed(#[source] BoxedError),
    /// Core run loop threw an error
    #[error("error during operation")]
    OperationalError(#[source] BoxedError),
    /// [`Heart`] provided by module died
    #[error("heart provided by module died: {0}")]
    HeartDied(DeathReason),
    /// Run loop exited cleanly
    #[error("run loop exited cleanly")]
    ExitedNormally,
    /// Timeout during startup
    #[error("timeout during startup")]
    Timeout,
}

impl ModuleTerminationReason {
    /// Whether the module terminated without an error
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            ModuleTerminationReason::HeartDied(_) | ModuleTerminationReason::ExitedNormally
        )
    }
}

/// Runner for [`Module`] implementations
pub struct ModuleRunner {
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ModuleRunner {
    /// Creates a new instance with custom timeouts for the startup and shutdown hooks
    pub fn new(startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            startup_timeout,
            shutdown_timeout,
        }
    }
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(60))
    }
}

impl ModuleRunner {
    /// Executes a [`Module`] until it exits by calling the corresponding lifecycle functions in
    /// order and returns the reason why it terminated.
    ///
    /// The module is borrowed so that its results can be inspected afterwards.
    #[instrument(skip(self, module), fields(module_name = type_name::<M>()))]
    pub async fn run<M: Module + Send>(&self, module: &mut M) -> ModuleTerminationReason {
        info!("Commencing module startup sequence");
        let startup = timeout(self.startup_timeout, module.pre_startup()).await;

        let termination_reason = match startup {
            Ok(Ok(_)) => Self::run_loop(module).await,
            Ok(Err(error)) => {
                error!(%error, "Module startup sequence encountered an error");
                ModuleTerminationReason::StartupFailed(error)
            }
            Err(_) => {
                error!("Module startup sequence timed out");
                ModuleTerminationReason::Timeout
            }
        };

        info!("Commencing module shutdown sequence");
        let result = timeout(
            self.shutdown_timeout,
            module.post_shutdown(&termination_reason),
        )
        .await;

        if result.is_err() {
            error!("Module shutdown sequence timed out");
        }

        termination_reason
    }

    async fn run_loop<M: Module + Send>(module: &mut M) -> ModuleTerminationReason {
        info!("Executing module run procedure");
        match module.run().await {
            Ok(None) => {
                debug!("Module run procedure completed successfully");
                ModuleTerminationReason::ExitedNormally
            }
            Ok(Some(mut heart)) => {
                debug!("Module run procedure completed successfully, entering run loop");
                let death_reason = heart.death().await;
                info!(%death_reason, "Heart provided by run procedure died");
                ModuleTerminationReason::HeartDied(death_reason)
            }
            Err(error) => {
                error!(%error, "Module run procedure encountered an error");
                ModuleTerminationReason::OperationalError(error)
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        fail_startup: bool,
        lifetime: Option<Duration>,
        hooks: Vec<&'static str>,
    }

    #[async_trait]
    impl Module for Recorder {
        async fn pre_startup(&mut self) -> EmptyResult {
            self.hooks.push("pre_startup");

            if self.fail_startup {
                Err("refusing to start".into())
            } else {
                Ok(())
            }
        }

        async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
            self.hooks.push("run");

            Ok(self.lifetime.map(|lifetime| Heart::with_lifetime(lifetime).0))
        }

        async fn post_shutdown(&mut self, _reason: &ModuleTerminationReason) {
            self.hooks.push("post_shutdown");
        }
    }

    #[tokio::test]
    async fn call_hooks_in_order() {
        let mut module = Recorder::default();
        let reason = ModuleRunner::default().run(&mut module).await;

        assert!(matches!(reason, ModuleTerminationReason::ExitedNormally));
        assert_eq!(module.hooks, vec!["pre_startup", "run", "post_shutdown"]);
    }

    #[tokio::test]
    async fn skip_run_when_startup_fails() {
        let mut module = Recorder {
            fail_startup: true,
            ..Default::default()
        };
        let reason = ModuleRunner::default().run(&mut module).await;

        assert!(matches!(reason, ModuleTerminationReason::StartupFailed(_)));
        assert!(!reason.is_clean());
        assert_eq!(module.hooks, vec!["pre_startup", "post_shutdown"]);
    }

    #[tokio::test]
    async fn await_returned_heart() {
        let mut module = Recorder {
            lifetime: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let reason = ModuleRunner::default().run(&mut module).await;

        assert!(matches!(
            reason,
            ModuleTerminationReason::HeartDied(DeathReason::LifetimeExceeded)
        ));
        assert!(reason.is_clean());
    }
}

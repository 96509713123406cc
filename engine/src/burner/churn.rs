//! Churn: periodic delete-and-recreate of a fraction of a job's objects,
//! stressing reconciliation paths while the cluster is loaded.
use chrono::{DateTime, Utc};
use kube::api::{Api, DynamicObject};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::labels;

use super::create::create_invocation;
use super::delete::delete_invocation;
use super::{drain, list_for_selector, Executor, InvocationCtx};

/// Wall-clock window a churn phase covered, correlated by the alert
/// evaluator.
#[derive(Debug, Clone, Copy)]
pub struct ChurnWindow {
    /// First cycle start.
    pub start: DateTime<Utc>,
    /// Last cycle end.
    pub end: DateTime<Utc>,
}

impl Executor {
    /// Run the configured churn cycles. Each cycle picks a random fraction
    /// of the job's iterations, deletes their objects and re-dispatches the
    /// create invocations, labeled as churned.
    pub async fn run_churn(&self) -> Result<Option<ChurnWindow>, Error> {
        let Some(churn) = &self.job.churn else {
            return Ok(None);
        };
        let iterations = self.job.job_iterations;
        let victims_per_cycle = iterations * usize::from(churn.percent) / 100;
        if victims_per_cycle == 0 {
            warn!(
                job = self.job.name.as_str(),
                percent = churn.percent,
                "churn selects no iterations, skipping"
            );
            return Ok(None);
        }
        info!(
            job = self.job.name.as_str(),
            cycles = churn.cycles,
            percent = churn.percent,
            "starting churn"
        );
        let ctx = self.invocation_ctx();
        let start = Utc::now();
        for cycle in 0..churn.cycles {
            super::pause(&self.cancel, churn.interval).await?;
            let selected: Vec<usize> = {
                let mut rng = rand::thread_rng();
                rand::seq::index::sample(&mut rng, iterations, victims_per_cycle).into_vec()
            };
            debug!(cycle, ?selected, "churning iterations");
            for iteration in selected {
                self.churn_iteration(&ctx, iteration).await?;
            }
        }
        Ok(Some(ChurnWindow {
            start,
            end: Utc::now(),
        }))
    }

    async fn churn_iteration(
        &self,
        ctx: &std::sync::Arc<InvocationCtx>,
        iteration: usize,
    ) -> Result<(), Error> {
        // Delete everything this iteration created.
        let selector = labels::iteration_selector(&self.job.name, iteration);
        let mut set = JoinSet::new();
        for object in &self.objects {
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &object.ar);
            let items = list_for_selector(
                &api,
                &selector,
                self.limiter.clone(),
                self.job.max_wait_timeout,
            )
            .await?;
            for item in items {
                set.spawn(delete_invocation(ctx.clone(), object.clone(), item));
            }
        }
        let delete_failures = drain(&mut set).await?;

        // Recreate the iteration's invocations, marked as churned.
        let mut set = JoinSet::new();
        for object in &self.objects {
            if object.spec.run_once && iteration > 0 {
                continue;
            }
            let ns = self.ensure_namespace_for(object, iteration).await?;
            for replica in 1..=object.spec.replicas {
                set.spawn(create_invocation(
                    ctx.clone(),
                    object.clone(),
                    iteration,
                    replica,
                    ns.clone(),
                    true,
                ));
            }
        }
        let create_failures = drain(&mut set).await?;
        if delete_failures + create_failures > 0 {
            warn!(
                iteration,
                delete_failures, create_failures, "churn cycle had failures"
            );
        }
        Ok(())
    }
}

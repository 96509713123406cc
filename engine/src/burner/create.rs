//! Create handler: POST rendered objects to their resolved endpoints.
use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::{DynamicObject, PostParams};
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::ExecutionMode;
use crate::error::Error;
use crate::labels;
use crate::render::TemplateVars;

use super::{
    acquire, drain, dynamic_api, pause, retry_transient, Executor, InvocationCtx, JobOutcome,
    JobState, ResolvedObject,
};

impl Executor {
    pub(crate) async fn run_create(&mut self) -> Result<JobOutcome, Error> {
        match self.job.execution_mode {
            ExecutionMode::Parallel => self.run_create_parallel().await,
            ExecutionMode::Sequential => self.run_create_sequential().await,
        }
    }

    /// Enqueue every invocation across all iterations and objects at once;
    /// the rate limiter is the only coordination primitive.
    async fn run_create_parallel(&mut self) -> Result<JobOutcome, Error> {
        let ctx = self.invocation_ctx();
        let mut set = JoinSet::new();
        for iteration in 0..self.job.job_iterations {
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
                        false,
                    ));
                }
            }
        }
        let failures = drain(&mut set).await?;
        self.set_state(JobState::Waiting);
        let unmet = if self.job.wait_when_finished {
            self.wait_all_objects().await?
        } else {
            0
        };
        Ok(JobOutcome { failures, unmet })
    }

    /// Barrier and wait per object, in declaration order, per iteration.
    async fn run_create_sequential(&mut self) -> Result<JobOutcome, Error> {
        let ctx = self.invocation_ctx();
        let selector = labels::job_selector(&self.job.name);
        let mut outcome = JobOutcome::default();
        for iteration in 0..self.job.job_iterations {
            for object in &self.objects {
                if object.spec.run_once && iteration > 0 {
                    continue;
                }
                let ns = self.ensure_namespace_for(object, iteration).await?;
                let mut set = JoinSet::new();
                for replica in 1..=object.spec.replicas {
                    set.spawn(create_invocation(
                        ctx.clone(),
                        object.clone(),
                        iteration,
                        replica,
                        ns.clone(),
                        false,
                    ));
                }
                outcome.failures += drain(&mut set).await?;
                if object.spec.wait_options.enabled {
                    outcome.unmet += self.wait_object(object, Some(iteration), &selector).await?;
                }
                pause(&self.cancel, self.job.object_delay).await?;
            }
            pause(&self.cancel, self.job.job_iteration_delay).await?;
        }
        Ok(outcome)
    }
}

/// One create invocation: render, rate-limit, POST, classify.
///
/// Each task renders its own payload; rendered buffers are never shared.
pub(crate) async fn create_invocation(
    ctx: Arc<InvocationCtx>,
    object: Arc<ResolvedObject>,
    iteration: usize,
    replica: usize,
    ns: Option<String>,
    churned: bool,
) -> Result<(), Error> {
    let vars = TemplateVars::new(&ctx.job_name, &ctx.uuid)
        .iteration(iteration)
        .replica(replica)
        .input_vars(&object.spec.input_vars);
    let rendered = ctx.renderer.render(&object.template, &vars)?;
    let mut obj: DynamicObject = serde_yaml::from_slice(&rendered)
        .map_err(|err| Error::Template(format!("rendered object is not valid YAML: {err}")))?;

    let mut stamped = labels::managed_labels(&ctx.uuid, &ctx.job_name, iteration);
    if churned {
        stamped.insert(labels::CHURN_LABEL.to_owned(), "true".to_owned());
    }
    obj.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(stamped);
    if let Some(ns) = &ns {
        obj.metadata.namespace = Some(ns.clone());
    }

    let api = dynamic_api(ctx.client.clone(), &object.ar, object.namespaced, ns.as_deref());
    let name = obj.metadata.name.clone().unwrap_or_default();
    let result = retry_transient(ctx.max_wait, || {
        let api = api.clone();
        let obj = obj.clone();
        let ctx = ctx.clone();
        async move {
            acquire(&ctx.limiter, &ctx.cancel).await?;
            api.create(&PostParams::default(), &obj)
                .await
                .map_err(Error::from)?;
            Ok(())
        }
    })
    .await;
    match result {
        Ok(()) => {
            debug!(
                kind = object.ar.kind.as_str(),
                name = name.as_str(),
                iteration,
                replica,
                "created object"
            );
            Ok(())
        }
        Err(Error::Conflict(_)) if ctx.idempotent => {
            debug!(
                kind = object.ar.kind.as_str(),
                name = name.as_str(),
                "object already exists"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

//! Patch handler: list by selector, patch every match with the declared
//! patch type.
use std::sync::Arc;

use kube::api::{DynamicObject, Patch, PatchParams};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::{ExecutionMode, PatchType};
use crate::error::Error;
use crate::labels;
use crate::render::TemplateVars;

use super::{
    acquire, drain, dynamic_api, pause, retry_transient, Executor, InvocationCtx, JobOutcome,
    JobState, ResolvedObject,
};

/// Field manager used for server-side apply patches.
const APPLY_FIELD_MANAGER: &str = "kube-controller-manager";

impl Executor {
    pub(crate) async fn run_patch(&mut self) -> Result<JobOutcome, Error> {
        match self.job.execution_mode {
            ExecutionMode::Parallel => self.run_patch_parallel().await,
            ExecutionMode::Sequential => self.run_patch_sequential().await,
        }
    }

    /// List once per object, then enqueue every (iteration, item) at once.
    async fn run_patch_parallel(&mut self) -> Result<JobOutcome, Error> {
        let ctx = self.invocation_ctx();
        let mut set = JoinSet::new();
        for object in &self.objects {
            let items = self.list_object_items(object).await?;
            for iteration in 0..self.job.job_iterations {
                for item in &items {
                    set.spawn(patch_invocation(
                        ctx.clone(),
                        object.clone(),
                        item.clone(),
                        iteration,
                    ));
                }
            }
        }
        let failures = drain(&mut set).await?;
        self.set_state(JobState::Waiting);
        let unmet = if self.job.wait_when_finished {
            self.wait_patched_objects().await?
        } else {
            0
        };
        Ok(JobOutcome { failures, unmet })
    }

    /// Fresh listing, barrier and wait per object, per iteration.
    async fn run_patch_sequential(&mut self) -> Result<JobOutcome, Error> {
        let ctx = self.invocation_ctx();
        let mut outcome = JobOutcome::default();
        for iteration in 0..self.job.job_iterations {
            for object in &self.objects {
                let items = self.list_object_items(object).await?;
                let mut set = JoinSet::new();
                for item in items {
                    set.spawn(patch_invocation(
                        ctx.clone(),
                        object.clone(),
                        item,
                        iteration,
                    ));
                }
                outcome.failures += drain(&mut set).await?;
                if object.spec.wait_options.enabled {
                    let selector = labels::selector_string(&object.spec.label_selector);
                    outcome.unmet += self.wait_object(object, None, &selector).await?;
                }
                pause(&self.cancel, self.job.object_delay).await?;
            }
            pause(&self.cancel, self.job.job_iteration_delay).await?;
        }
        Ok(outcome)
    }

    /// After patching, wait until the patched selection is ready again.
    async fn wait_patched_objects(&self) -> Result<usize, Error> {
        let mut unmet = 0;
        for object in &self.objects {
            if !object.spec.wait_options.enabled {
                continue;
            }
            let selector = labels::selector_string(&object.spec.label_selector);
            unmet += self.wait_object(object, None, &selector).await?;
        }
        Ok(unmet)
    }
}

/// One patch invocation: render, rate-limit, PATCH, classify.
///
/// A 403 aborts the whole job and is never retried.
async fn patch_invocation(
    ctx: Arc<InvocationCtx>,
    object: Arc<ResolvedObject>,
    item: DynamicObject,
    iteration: usize,
) -> Result<(), Error> {
    let Some(patch_type) = object.spec.patch_type else {
        return Err(Error::Config(format!(
            "patch object {} has no patch type",
            object.ar.kind
        )));
    };
    // JSON templates are used verbatim; everything else is rendered.
    let data = if object.raw_json_template() {
        object.template.clone()
    } else {
        let vars = TemplateVars::new(&ctx.job_name, &ctx.uuid)
            .iteration(iteration)
            .input_vars(&object.spec.input_vars);
        ctx.renderer.render(&object.template, &vars)?
    };

    let name = item.metadata.name.clone().unwrap_or_default();
    let ns = item.metadata.namespace.clone();
    let api = dynamic_api(ctx.client.clone(), &object.ar, object.namespaced, ns.as_deref());
    debug!(
        kind = object.ar.kind.as_str(),
        name = name.as_str(),
        namespace = ns.as_deref().unwrap_or_default(),
        iteration,
        "patching object"
    );
    retry_transient(ctx.max_wait, || {
        let api = api.clone();
        let name = name.clone();
        let data = data.clone();
        let ctx = ctx.clone();
        async move {
            let (params, patch) = build_patch(patch_type, &data)?;
            acquire(&ctx.limiter, &ctx.cancel).await?;
            api.patch(&name, &params, &patch).await.map_err(Error::from)?;
            Ok(())
        }
    })
    .await
}

/// Translate the declared patch type into request parameters.
///
/// `apply` keeps the YAML tree and sets a field manager; the client-side
/// types convert the rendered YAML to JSON first.
fn build_patch(patch_type: PatchType, data: &[u8]) -> Result<(PatchParams, Patch<Value>), Error> {
    let value: Value = serde_yaml::from_slice(data)
        .map_err(|err| Error::Template(format!("patch payload: {err}")))?;
    Ok(match patch_type {
        PatchType::Apply => (PatchParams::apply(APPLY_FIELD_MANAGER), Patch::Apply(value)),
        PatchType::Merge => (PatchParams::default(), Patch::Merge(value)),
        PatchType::Strategic => (PatchParams::default(), Patch::Strategic(value)),
        PatchType::Json => {
            let ops: json_patch::Patch = serde_json::from_value(value)
                .map_err(|err| Error::Template(format!("json patch payload: {err}")))?;
            (PatchParams::default(), Patch::Json(ops))
        }
    })
}

//! Delete handler: list by selector, delete every match with foreground
//! propagation.
use std::sync::Arc;

use kube::api::{DeleteParams, DynamicObject, PropagationPolicy};
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::Error;
use crate::labels;

use super::{
    acquire, drain, dynamic_api, retry_transient, Executor, InvocationCtx, JobOutcome, JobState,
    ResolvedObject,
};

impl Executor {
    /// Deletion is a single sweep over the current selection.
    pub(crate) async fn run_delete(&mut self) -> Result<JobOutcome, Error> {
        let ctx = self.invocation_ctx();
        let mut set = JoinSet::new();
        for object in &self.objects {
            let items = self.list_object_items(object).await?;
            for item in items {
                set.spawn(delete_invocation(ctx.clone(), object.clone(), item));
            }
        }
        let failures = drain(&mut set).await?;
        self.set_state(JobState::Waiting);
        let mut unmet = 0;
        if self.job.wait_when_finished {
            for object in &self.objects {
                let selector = labels::selector_string(&object.spec.label_selector);
                unmet += self.wait_object_deleted(object, &selector).await?;
            }
        }
        Ok(JobOutcome { failures, unmet })
    }
}

/// One delete invocation. Foreground propagation unless the server decides
/// otherwise; a vanished object is success.
pub(crate) async fn delete_invocation(
    ctx: Arc<InvocationCtx>,
    object: Arc<ResolvedObject>,
    item: DynamicObject,
) -> Result<(), Error> {
    let name = item.metadata.name.clone().unwrap_or_default();
    let ns = item.metadata.namespace.clone();
    let api = dynamic_api(ctx.client.clone(), &object.ar, object.namespaced, ns.as_deref());
    debug!(
        kind = object.ar.kind.as_str(),
        name = name.as_str(),
        namespace = ns.as_deref().unwrap_or_default(),
        "deleting object"
    );
    let result = retry_transient(ctx.max_wait, || {
        let api = api.clone();
        let name = name.clone();
        let ctx = ctx.clone();
        async move {
            acquire(&ctx.limiter, &ctx.cancel).await?;
            let params = DeleteParams {
                propagation_policy: Some(PropagationPolicy::Foreground),
                ..DeleteParams::default()
            };
            api.delete(&name, &params).await.map_err(Error::from)?;
            Ok(())
        }
    })
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(Error::NotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

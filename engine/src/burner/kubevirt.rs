//! KubeVirt handler: VM lifecycle operations via subresource calls.
use std::sync::Arc;

use kube::api::DynamicObject;
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::KubeVirtOp;
use crate::error::Error;
use crate::render::TemplateVars;

use super::{
    acquire, drain, dynamic_api, pause, retry_transient, Executor, InvocationCtx, JobOutcome,
    ResolvedObject,
};

/// API group serving VM lifecycle subresources.
const SUBRESOURCE_GROUP: &str = "subresources.kubevirt.io";

impl Executor {
    pub(crate) async fn run_kubevirt(&mut self) -> Result<JobOutcome, Error> {
        let ctx = self.invocation_ctx();
        let mut outcome = JobOutcome::default();
        for iteration in 0..self.job.job_iterations.max(1) {
            let mut set = JoinSet::new();
            for object in &self.objects {
                let vms = self.target_vms(object, iteration).await?;
                for vm in vms {
                    set.spawn(kubevirt_invocation(
                        ctx.clone(),
                        object.clone(),
                        vm,
                        iteration,
                    ));
                }
            }
            outcome.failures += drain(&mut set).await?;
            pause(&self.cancel, self.job.job_iteration_delay).await?;
        }
        Ok(outcome)
    }

    /// VMs an instruction targets: one by name, or every selector match.
    async fn target_vms(
        &self,
        object: &Arc<ResolvedObject>,
        iteration: usize,
    ) -> Result<Vec<DynamicObject>, Error> {
        match &object.spec.object_name {
            Some(name) => {
                let ns = self.job.namespace_for(iteration);
                let api = dynamic_api(
                    self.client.clone(),
                    &object.ar,
                    object.namespaced,
                    Some(&ns),
                );
                Ok(vec![api.get(name).await.map_err(Error::from)?])
            }
            None => self.list_object_items(object).await,
        }
    }
}

/// One lifecycle invocation: a PUT on the VM's subresource endpoint.
async fn kubevirt_invocation(
    ctx: Arc<InvocationCtx>,
    object: Arc<ResolvedObject>,
    vm: DynamicObject,
    iteration: usize,
) -> Result<(), Error> {
    let Some(op) = object.spec.kube_virt_op else {
        return Err(Error::Config(format!(
            "kubevirt object {} has no operation",
            object.ar.kind
        )));
    };
    let name = vm.metadata.name.clone().unwrap_or_default();
    let ns = vm
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_owned());
    // Volume operations carry a rendered options payload; the rest send an
    // empty body.
    let body = if object.template.is_empty() {
        b"{}".to_vec()
    } else {
        let vars = TemplateVars::new(&ctx.job_name, &ctx.uuid)
            .iteration(iteration)
            .input_vars(&object.spec.input_vars);
        ctx.renderer.render(&object.template, &vars)?
    };
    debug!(vm = name.as_str(), namespace = ns.as_str(), ?op, "vm lifecycle call");
    retry_transient(ctx.max_wait, || {
        let ctx = ctx.clone();
        let path = subresource_path(&ns, &name, op);
        let body = body.clone();
        async move {
            acquire(&ctx.limiter, &ctx.cancel).await?;
            let request = http::Request::builder()
                .method(http::Method::PUT)
                .uri(path)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body)
                .map_err(|err| Error::Other(err.into()))?;
            ctx.client
                .request_text(request)
                .await
                .map_err(Error::from)?;
            Ok(())
        }
    })
    .await
}

/// Subresource endpoint for a lifecycle verb. Pause and unpause act on the
/// VM instance, the rest on the VM itself.
fn subresource_path(ns: &str, name: &str, op: KubeVirtOp) -> String {
    let (resource, verb) = match op {
        KubeVirtOp::Start => ("virtualmachines", "start"),
        KubeVirtOp::Stop => ("virtualmachines", "stop"),
        KubeVirtOp::Restart => ("virtualmachines", "restart"),
        KubeVirtOp::Pause => ("virtualmachineinstances", "pause"),
        KubeVirtOp::Unpause => ("virtualmachineinstances", "unpause"),
        KubeVirtOp::Migrate => ("virtualmachines", "migrate"),
        KubeVirtOp::AddVolume => ("virtualmachines", "addvolume"),
        KubeVirtOp::RemoveVolume => ("virtualmachines", "removevolume"),
    };
    format!("/apis/{SUBRESOURCE_GROUP}/v1/namespaces/{ns}/{resource}/{name}/{verb}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_paths_target_the_subresource_api() {
        assert_eq!(
            subresource_path("vms", "vm-0", KubeVirtOp::Start),
            "/apis/subresources.kubevirt.io/v1/namespaces/vms/virtualmachines/vm-0/start"
        );
        assert_eq!(
            subresource_path("vms", "vm-0", KubeVirtOp::Pause),
            "/apis/subresources.kubevirt.io/v1/namespaces/vms/virtualmachineinstances/vm-0/pause"
        );
        assert_eq!(
            subresource_path("vms", "vm-0", KubeVirtOp::AddVolume),
            "/apis/subresources.kubevirt.io/v1/namespaces/vms/virtualmachines/vm-0/addvolume"
        );
    }
}

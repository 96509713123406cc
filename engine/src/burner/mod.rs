//! The job executor: expands jobs into rate-limited invocation storms.
pub mod churn;
mod create;
mod delete;
mod kubevirt;
pub(crate) mod namespaces;
mod patch;
mod read;
#[cfg(test)]
pub(crate) mod stub;
pub mod wait;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Job, JobType, ObjectSpec, PatchType};
use crate::error::Error;
use crate::labels;
use crate::limiter::RateLimiter;
use crate::mapper::RestMapper;
use crate::render::{Renderer, TemplateVars};

use self::namespaces::NamespaceManager;

pub use self::churn::ChurnWindow;

/// Lifecycle states of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Constructed, nothing resolved yet.
    Init,
    /// Resolving endpoints and loading templates.
    Resolving,
    /// Dispatching invocations.
    Running,
    /// At the closing barrier, polling readiness.
    Waiting,
    /// Finished, readiness satisfied or timed out.
    Complete,
    /// Terminated by a fatal error.
    Aborted,
}

/// Tally of a finished job.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobOutcome {
    /// Invocations that failed with a non-fatal error.
    pub failures: usize,
    /// Resources that never satisfied their readiness predicate.
    pub unmet: usize,
}

/// An object instruction with its endpoint resolved and template loaded.
pub struct ResolvedObject {
    /// The instruction from the job configuration.
    pub spec: ObjectSpec,
    /// REST resource the instruction targets.
    pub ar: ApiResource,
    /// Whether the resource lives in namespaces.
    pub namespaced: bool,
    /// Raw template bytes; empty when the object carries no template.
    pub template: Vec<u8>,
}

impl ResolvedObject {
    /// JSON templates bypass rendering and may not be server-side applied.
    pub fn raw_json_template(&self) -> bool {
        self.spec
            .object_template
            .as_ref()
            .and_then(|path| path.extension())
            .is_some_and(|ext| ext == "json")
    }
}

/// Shared state every invocation task needs, cloned into the task via `Arc`.
pub(crate) struct InvocationCtx {
    pub client: Client,
    pub job_name: String,
    pub uuid: String,
    pub idempotent: bool,
    pub max_wait: Duration,
    pub limiter: Arc<RateLimiter>,
    pub renderer: Arc<Renderer>,
    pub cancel: CancellationToken,
}

/// Executes a single job to completion.
pub struct Executor {
    pub(crate) job: Job,
    pub(crate) uuid: String,
    pub(crate) client: Client,
    pub(crate) objects: Vec<Arc<ResolvedObject>>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) wait_limiter: Arc<RateLimiter>,
    pub(crate) renderer: Arc<Renderer>,
    pub(crate) namespaces: NamespaceManager,
    pub(crate) cancel: CancellationToken,
    state: JobState,
}

impl Executor {
    /// Create an executor for `job` labeled with the run id `uuid`.
    pub fn new(
        job: Job,
        uuid: String,
        client: Client,
        wait_limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(job.qps, job.burst));
        let renderer = Arc::new(Renderer::new(job.missing_key_policy));
        let namespaces = NamespaceManager::new(client.clone(), uuid.clone(), job.name.clone());
        Self {
            job,
            uuid,
            client,
            objects: Vec::new(),
            limiter,
            wait_limiter,
            renderer,
            namespaces,
            cancel,
            state: JobState::Init,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Resolve endpoints, load templates and validate (INIT → RESOLVING).
    ///
    /// Template errors, including missing keys under the `error` policy and
    /// `apply` patches backed by JSON, surface here, before any dispatch.
    pub fn prepare(&mut self, mapper: &RestMapper, base_dir: &Path) -> Result<(), Error> {
        let mut renderer = Renderer::new(self.job.missing_key_policy);
        register_partials(&mut renderer, base_dir)?;
        let base_dir = base_dir.to_path_buf();
        self.prepare_with(mapper, renderer, |path: &Path| {
            std::fs::read(base_dir.join(path))
                .map_err(|err| Error::Config(format!("reading template {}: {err}", path.display())))
        })
    }

    /// `prepare` with an explicit template loader.
    pub(crate) fn prepare_with(
        &mut self,
        mapper: &RestMapper,
        renderer: Renderer,
        loader: impl Fn(&Path) -> Result<Vec<u8>, Error>,
    ) -> Result<(), Error> {
        self.state = JobState::Resolving;
        let mut objects = Vec::with_capacity(self.job.objects.len());
        for spec in &self.job.objects {
            let mut spec = spec.clone();
            let template = match &spec.object_template {
                Some(path) => loader(path)?,
                None => Vec::new(),
            };
            let raw_json = spec
                .object_template
                .as_ref()
                .and_then(|path| path.extension())
                .is_some_and(|ext| ext == "json");
            if self.job.job_type == JobType::Patch
                && spec.patch_type == Some(PatchType::Apply)
                && raw_json
            {
                return Err(Error::Template(format!(
                    "job {}: apply patch type requires a YAML template",
                    self.job.name
                )));
            }
            if !template.is_empty() && !raw_json {
                // Probe render: fail before any dispatch happens.
                let probe = renderer.render(
                    &template,
                    &TemplateVars::new(&self.job.name, &self.uuid)
                        .iteration(0)
                        .replica(1)
                        .input_vars(&spec.input_vars),
                )?;
                if spec.kind.is_none() && self.job.job_type == JobType::Create {
                    let head: TypeHead = serde_yaml::from_slice(&probe).map_err(|err| {
                        Error::Template(format!("rendered object has no type header: {err}"))
                    })?;
                    spec.api_version = head.api_version;
                    spec.kind = Some(head.kind);
                }
            }
            let kind = spec.kind.clone().ok_or_else(|| {
                Error::Config(format!("job {}: object needs a kind", self.job.name))
            })?;
            let resolved = mapper.resolve(&spec.api_version, &kind)?;
            debug!(
                job = self.job.name.as_str(),
                kind = kind.as_str(),
                resource = resolved.ar.plural.as_str(),
                "resolved object endpoint"
            );
            objects.push(Arc::new(ResolvedObject {
                spec,
                ar: resolved.ar.clone(),
                namespaced: resolved.namespaced,
                template,
            }));
        }
        self.objects = objects;
        self.renderer = Arc::new(renderer);
        Ok(())
    }

    /// Execute the job (RESOLVING → RUNNING → WAITING → COMPLETE/ABORTED).
    pub async fn run(&mut self) -> Result<JobOutcome, Error> {
        info!(
            job = self.job.name.as_str(),
            job_type = ?self.job.job_type,
            mode = ?self.job.execution_mode,
            iterations = self.job.job_iterations,
            "running job"
        );
        self.state = JobState::Running;
        let result = match self.job.job_type {
            JobType::Create => self.run_create().await,
            JobType::Patch => self.run_patch().await,
            JobType::Delete => self.run_delete().await,
            JobType::Read => self.run_read().await,
            JobType::KubeVirt => self.run_kubevirt().await,
            JobType::Check => self.run_check().await,
        };
        match result {
            Ok(outcome) => {
                self.state = JobState::Complete;
                Ok(outcome)
            }
            Err(err) => {
                self.state = JobState::Aborted;
                Err(err)
            }
        }
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    pub(crate) fn invocation_ctx(&self) -> Arc<InvocationCtx> {
        Arc::new(InvocationCtx {
            client: self.client.clone(),
            job_name: self.job.name.clone(),
            uuid: self.uuid.clone(),
            idempotent: self.job.idempotent,
            max_wait: self.job.max_wait_timeout,
            limiter: self.limiter.clone(),
            renderer: self.renderer.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Ensure the iteration's namespace exists before dispatching into it.
    pub(crate) async fn ensure_namespace_for(
        &self,
        object: &ResolvedObject,
        iteration: usize,
    ) -> Result<Option<String>, Error> {
        if !object.namespaced {
            return Ok(None);
        }
        let ns = self.job.namespace_for(iteration);
        self.namespaces.ensure(&ns).await?;
        Ok(Some(ns))
    }

    /// List the live objects an instruction selects, cluster-wide.
    pub(crate) async fn list_object_items(
        &self,
        object: &ResolvedObject,
    ) -> Result<Vec<DynamicObject>, Error> {
        let selector = labels::selector_string(&object.spec.label_selector);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &object.ar);
        let items = list_for_selector(
            &api,
            &selector,
            self.limiter.clone(),
            self.job.max_wait_timeout,
        )
        .await?;
        info!(
            count = items.len(),
            resource = object.ar.plural.as_str(),
            selector = selector.as_str(),
            "listed objects"
        );
        Ok(items)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeHead {
    #[serde(default = "head_api_version")]
    api_version: String,
    kind: String,
}

fn head_api_version() -> String {
    "v1".to_owned()
}

/// Register `*.partial` files next to the configuration as partials.
fn register_partials(renderer: &mut Renderer, base_dir: &Path) -> Result<(), Error> {
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "partial") {
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)
                .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
            renderer.register_partial(stem, &content)?;
        }
    }
    Ok(())
}

/// Build a dynamic API for a resolved resource.
pub(crate) fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    ns: Option<&str>,
) -> Api<DynamicObject> {
    match (namespaced, ns) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// Join every spawned invocation, counting non-fatal failures.
///
/// A fatal classification aborts the remaining tasks and the job.
pub(crate) async fn drain(set: &mut JoinSet<Result<(), Error>>) -> Result<usize, Error> {
    let mut failures = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_fatal() => {
                set.abort_all();
                error!("aborting job: {err}");
                return Err(err);
            }
            Ok(Err(Error::Interrupted)) => {}
            Ok(Err(err)) => {
                warn!("invocation failed: {err}");
                failures += 1;
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                return Err(Error::Other(anyhow::anyhow!(
                    "invocation task panicked: {join_err}"
                )))
            }
        }
    }
    Ok(failures)
}

/// Sleep that honors cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<(), Error> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Interrupted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Take a dispatch token, honoring cancellation.
pub(crate) async fn acquire(
    limiter: &RateLimiter,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Interrupted),
        _ = limiter.acquire() => Ok(()),
    }
}

/// Retry `op` on transient failures with exponential backoff, bounded by
/// `max_elapsed`.
pub(crate) async fn retry_transient<T, F, Fut>(max_elapsed: Duration, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let started = tokio::time::Instant::now();
    let mut delay = Duration::from_secs(1);
    loop {
        match op().await {
            Err(err) if err.is_transient() && started.elapsed() + delay < max_elapsed => {
                warn!("transient error, retrying in {delay:?}: {err}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            other => return other,
        }
    }
}

/// List resources by label selector, retrying transient failures.
pub(crate) async fn list_for_selector(
    api: &Api<DynamicObject>,
    selector: &str,
    limiter: Arc<RateLimiter>,
    max_wait: Duration,
) -> Result<Vec<DynamicObject>, Error> {
    retry_transient(max_wait, || {
        let api = api.clone();
        let selector = selector.to_owned();
        let limiter = limiter.clone();
        async move {
            limiter.acquire().await;
            let list = api
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(Error::from)?;
            Ok(list.items)
        }
    })
    .await
}

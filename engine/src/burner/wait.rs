//! Post-condition polling: per-kind readiness predicates.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{DynamicObject, ListParams};
use kube::Client;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CustomCondition;
use crate::error::Error;
use crate::labels;
use crate::limiter::RateLimiter;

use super::{acquire, dynamic_api, pause, Executor, JobOutcome, JobState, ResolvedObject};

/// Whether a readiness predicate exists for `kind`.
pub fn has_predicate(kind: &str, custom: Option<&CustomCondition>) -> bool {
    custom.is_some()
        || matches!(
            kind,
            "Pod"
                | "Deployment"
                | "ReplicaSet"
                | "StatefulSet"
                | "DaemonSet"
                | "Job"
                | "PersistentVolumeClaim"
                | "VirtualMachineInstance"
        )
}

/// Whether `item` satisfies the readiness predicate for `kind`.
pub fn is_ready(kind: &str, item: &DynamicObject, custom: Option<&CustomCondition>) -> bool {
    if let Some(condition) = custom {
        return condition_met(item, condition);
    }
    match kind {
        "Pod" => pod_ready(item),
        "Deployment" | "ReplicaSet" | "StatefulSet" => replicas_ready(item),
        "DaemonSet" => daemonset_ready(item),
        "Job" => job_done(item),
        "PersistentVolumeClaim" => phase_is(item, "Bound"),
        "VirtualMachineInstance" => phase_is(item, "Running"),
        _ => true,
    }
}

fn phase_is(item: &DynamicObject, phase: &str) -> bool {
    item.data.pointer("/status/phase").and_then(Value::as_str) == Some(phase)
}

fn pod_ready(item: &DynamicObject) -> bool {
    phase_is(item, "Running")
        && item
            .data
            .pointer("/status/containerStatuses")
            .and_then(Value::as_array)
            .is_some_and(|containers| {
                containers
                    .iter()
                    .all(|c| c.get("ready").and_then(Value::as_bool).unwrap_or(false))
            })
}

fn replicas_ready(item: &DynamicObject) -> bool {
    let want = item
        .data
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = item
        .data
        .pointer("/status/readyReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    ready == want
}

fn daemonset_ready(item: &DynamicObject) -> bool {
    let Some(status) = item.data.get("status") else {
        return false;
    };
    let desired = status
        .get("desiredNumberScheduled")
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let ready = status.get("numberReady").and_then(Value::as_i64).unwrap_or(0);
    desired >= 0 && ready == desired
}

fn job_done(item: &DynamicObject) -> bool {
    let succeeded = item
        .data
        .pointer("/status/succeeded")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    succeeded >= 1
        || condition_met(
            item,
            &CustomCondition {
                condition_type: "Complete".to_owned(),
                status: "True".to_owned(),
            },
        )
}

fn condition_met(item: &DynamicObject, condition: &CustomCondition) -> bool {
    item.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(condition.condition_type.as_str())
                    && c.get("status").and_then(Value::as_str) == Some(condition.status.as_str())
            })
        })
}

/// Polls selector-matched objects until their readiness predicates hold.
///
/// Polling goes through a dedicated limiter so it does not steal dispatch
/// tokens, and backs off exponentially within the job's `maxWaitTimeout`.
pub struct WaitEngine {
    client: Client,
    limiter: Arc<RateLimiter>,
}

impl WaitEngine {
    /// Create a wait engine polling through `limiter`.
    pub fn new(client: Client, limiter: Arc<RateLimiter>) -> Self {
        Self { client, limiter }
    }

    /// Block until every matched item is ready, or the timeout lapses.
    ///
    /// On timeout the error carries how many resources were still unmet; the
    /// caller decides whether that is terminal.
    pub async fn wait_ready(
        &self,
        object: &ResolvedObject,
        namespaces: &BTreeSet<Option<String>>,
        selector: &str,
        max_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let custom = object.spec.wait_options.for_condition.as_ref();
        if !has_predicate(&object.ar.kind, custom) {
            debug!(kind = object.ar.kind.as_str(), "no readiness predicate, not waiting");
            return Ok(());
        }
        self.poll(object, namespaces, selector, max_timeout, cancel, |items| {
            items
                .iter()
                .filter(|item| !is_ready(&object.ar.kind, item, custom))
                .count()
        })
        .await
    }

    /// Block until nothing matches `selector` anymore.
    pub async fn wait_deleted(
        &self,
        object: &ResolvedObject,
        namespaces: &BTreeSet<Option<String>>,
        selector: &str,
        max_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.poll(object, namespaces, selector, max_timeout, cancel, |items| {
            items.len()
        })
        .await
    }

    async fn poll(
        &self,
        object: &ResolvedObject,
        namespaces: &BTreeSet<Option<String>>,
        selector: &str,
        max_timeout: Duration,
        cancel: &CancellationToken,
        unmet_count: impl Fn(&[DynamicObject]) -> usize,
    ) -> Result<(), Error> {
        let opts = &object.spec.wait_options;
        let started = Instant::now();
        let mut interval = opts.initial_interval;
        loop {
            let mut unmet = 0;
            for ns in namespaces {
                acquire(&self.limiter, cancel).await?;
                let api = dynamic_api(
                    self.client.clone(),
                    &object.ar,
                    object.namespaced,
                    ns.as_deref(),
                );
                match api.list(&ListParams::default().labels(selector)).await {
                    Ok(list) => unmet += unmet_count(&list.items),
                    Err(err) => {
                        warn!(
                            resource = object.ar.plural.as_str(),
                            "polling list failed: {err}"
                        );
                        unmet += 1;
                    }
                }
            }
            if unmet == 0 {
                return Ok(());
            }
            if started.elapsed() >= max_timeout {
                return Err(Error::WaitTimeout { unmet });
            }
            debug!(
                unmet,
                resource = object.ar.plural.as_str(),
                "waiting for readiness"
            );
            pause(cancel, interval).await?;
            interval = Duration::from_secs_f64(
                (interval.as_secs_f64() * opts.multiplier)
                    .min(opts.max_interval.as_secs_f64()),
            );
        }
    }
}

impl Executor {
    /// Wait once for every object of the job, as parallel mode does at its
    /// closing barrier.
    pub(crate) async fn wait_all_objects(&self) -> Result<usize, Error> {
        let selector = labels::job_selector(&self.job.name);
        let mut unmet = 0;
        for object in &self.objects {
            if !object.spec.wait_options.enabled {
                continue;
            }
            unmet += self.wait_object(object, None, &selector).await?;
        }
        Ok(unmet)
    }

    /// Wait for one object, returning the unmet count on timeout.
    pub(crate) async fn wait_object(
        &self,
        object: &Arc<ResolvedObject>,
        iteration: Option<usize>,
        selector: &str,
    ) -> Result<usize, Error> {
        let engine = WaitEngine::new(self.client.clone(), self.wait_limiter.clone());
        let namespaces = self.namespaces_for(object, iteration);
        match engine
            .wait_ready(
                object,
                &namespaces,
                selector,
                self.job.max_wait_timeout,
                &self.cancel,
            )
            .await
        {
            Ok(()) => Ok(0),
            Err(Error::WaitTimeout { unmet }) => {
                warn!(
                    job = self.job.name.as_str(),
                    kind = object.ar.kind.as_str(),
                    unmet,
                    "timed out waiting for readiness"
                );
                Ok(unmet)
            }
            Err(err) => Err(err),
        }
    }

    /// Wait until the object's selection is empty, tolerating timeouts.
    pub(crate) async fn wait_object_deleted(
        &self,
        object: &Arc<ResolvedObject>,
        selector: &str,
    ) -> Result<usize, Error> {
        let engine = WaitEngine::new(self.client.clone(), self.wait_limiter.clone());
        let namespaces = self.namespaces_for(object, None);
        match engine
            .wait_deleted(
                object,
                &namespaces,
                selector,
                self.job.max_wait_timeout,
                &self.cancel,
            )
            .await
        {
            Ok(()) => Ok(0),
            Err(Error::WaitTimeout { unmet }) => {
                warn!(
                    job = self.job.name.as_str(),
                    kind = object.ar.kind.as_str(),
                    unmet,
                    "timed out waiting for deletion"
                );
                Ok(unmet)
            }
            Err(err) => Err(err),
        }
    }

    /// Check jobs: verify readiness of selector-matched objects without
    /// mutating anything.
    pub(crate) async fn run_check(&mut self) -> Result<JobOutcome, Error> {
        self.set_state(JobState::Waiting);
        let mut outcome = JobOutcome::default();
        let objects = self.objects.clone();
        for object in &objects {
            let selector = labels::selector_string(&object.spec.label_selector);
            outcome.unmet += self.wait_object(object, None, &selector).await?;
        }
        Ok(outcome)
    }

    fn namespaces_for(
        &self,
        object: &ResolvedObject,
        iteration: Option<usize>,
    ) -> BTreeSet<Option<String>> {
        if !object.namespaced {
            return BTreeSet::from([None]);
        }
        match iteration {
            Some(iteration) => BTreeSet::from([Some(self.job.namespace_for(iteration))]),
            None => (0..self.job.job_iterations.max(1))
                .map(|iteration| Some(self.job.namespace_for(iteration)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn item(data: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Thing",
            "metadata": {"name": "thing-0"},
        }))
        .map(|mut obj: DynamicObject| {
            obj.data = data;
            obj
        })
        .expect("item should deserialize")
    }

    #[test]
    fn pod_requires_running_phase_and_ready_containers() {
        let ready = item(json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{"ready": true}, {"ready": true}],
            }
        }));
        assert!(is_ready("Pod", &ready, None));

        let unready_container = item(json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{"ready": true}, {"ready": false}],
            }
        }));
        assert!(!is_ready("Pod", &unready_container, None));

        let pending = item(json!({"status": {"phase": "Pending"}}));
        assert!(!is_ready("Pod", &pending, None));
    }

    #[test]
    fn workload_kinds_compare_ready_replicas_to_spec() {
        let ready = item(json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 3},
        }));
        assert!(is_ready("Deployment", &ready, None));
        assert!(is_ready("StatefulSet", &ready, None));

        let rolling = item(json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 2},
        }));
        assert!(!is_ready("ReplicaSet", &rolling, None));

        // No status yet means nothing is ready.
        let fresh = item(json!({"spec": {"replicas": 1}}));
        assert!(!is_ready("Deployment", &fresh, None));
    }

    #[test]
    fn daemonset_compares_number_ready_to_desired() {
        let ready = item(json!({
            "status": {"desiredNumberScheduled": 2, "numberReady": 2}
        }));
        assert!(is_ready("DaemonSet", &ready, None));
        let fresh = item(json!({}));
        assert!(!is_ready("DaemonSet", &fresh, None));
    }

    #[test]
    fn job_succeeds_by_count_or_condition() {
        let by_count = item(json!({"status": {"succeeded": 1}}));
        assert!(is_ready("Job", &by_count, None));

        let by_condition = item(json!({
            "status": {"conditions": [{"type": "Complete", "status": "True"}]}
        }));
        assert!(is_ready("Job", &by_condition, None));

        let running = item(json!({"status": {"active": 1}}));
        assert!(!is_ready("Job", &running, None));
    }

    #[test]
    fn pvc_and_vmi_use_phase() {
        assert!(is_ready(
            "PersistentVolumeClaim",
            &item(json!({"status": {"phase": "Bound"}})),
            None
        ));
        assert!(is_ready(
            "VirtualMachineInstance",
            &item(json!({"status": {"phase": "Running"}})),
            None
        ));
        assert!(!is_ready(
            "VirtualMachineInstance",
            &item(json!({"status": {"phase": "Scheduling"}})),
            None
        ));
    }

    #[test]
    fn custom_condition_overrides_builtins() {
        let condition = CustomCondition {
            condition_type: "Synced".to_owned(),
            status: "True".to_owned(),
        };
        let synced = item(json!({
            "status": {"conditions": [{"type": "Synced", "status": "True"}]}
        }));
        assert!(is_ready("Widget", &synced, Some(&condition)));
        assert!(has_predicate("Widget", Some(&condition)));
        assert!(!has_predicate("Widget", None));
    }
}

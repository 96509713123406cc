//! Place all workload configuration types into a single module so they can be
//! used as a lightweight dependency.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Top level configuration: global settings plus the ordered job list.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Settings shared by every job of the run.
    #[serde(default)]
    pub global: GlobalConfig,
    /// Jobs, executed in declaration order.
    pub jobs: Vec<Job>,
}

impl Config {
    /// Load a configuration from a YAML file, normalizing and validating it.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .map_err(|err| Error::Config(format!("parsing {}: {err}", path.display())))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill derived defaults that serde cannot express.
    pub fn normalize(&mut self) {
        for job in &mut self.jobs {
            if job.namespace.is_empty() {
                job.namespace = job.name.clone();
            }
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), Error> {
        for job in &self.jobs {
            job.validate()?;
        }
        Ok(())
    }
}

/// Settings shared by every job of a run.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Timeout for metrics backend requests.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// QPS budget for wait-engine polling, independent of job dispatch.
    #[serde(default = "default_client_qps")]
    pub client_qps: f64,
    /// Burst budget for wait-engine polling.
    #[serde(default = "default_client_burst")]
    pub client_burst: u32,
    /// Alert profile evaluated after the run, relative to the config file.
    #[serde(default)]
    pub alert_profile: Option<PathBuf>,
    /// Metrics backend to evaluate alerts against.
    #[serde(default)]
    pub prometheus: Option<PrometheusConfig>,
    /// Where alert documents are indexed.
    #[serde(default)]
    pub indexer: Option<IndexerConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            client_qps: default_client_qps(),
            client_burst: default_client_burst(),
            alert_profile: None,
            prometheus: None,
            indexer: None,
        }
    }
}

/// Location and step of the metrics backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    /// Base URL, e.g. `http://prometheus:9090`.
    pub url: String,
    /// Range query step.
    #[serde(with = "humantime_serde", default = "default_step")]
    pub step: Duration,
}

/// Local indexer sink settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfig {
    /// Directory documents are written below.
    pub directory: PathBuf,
}

/// The kind of work a job performs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Post rendered objects.
    Create,
    /// Patch objects matched by label selector.
    Patch,
    /// Delete objects matched by label selector.
    Delete,
    /// List objects matched by label selector.
    Read,
    /// Drive VM lifecycle subresources.
    KubeVirt,
    /// Verify readiness of objects matched by label selector.
    Check,
}

/// How invocations of a job are scheduled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Every invocation is enqueued at once; the rate limiter is the only
    /// coordination primitive.
    #[default]
    Parallel,
    /// Objects barrier and wait one after another, per iteration.
    Sequential,
}

/// Patch strategies supported by the patch handler.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    /// RFC 6902 JSON patch.
    Json,
    /// RFC 7386 merge patch.
    Merge,
    /// Kubernetes strategic merge patch.
    Strategic,
    /// Server-side apply.
    Apply,
}

/// What the renderer does when a template references an undefined variable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissingKeyPolicy {
    /// Rendering fails.
    #[default]
    Error,
    /// The reference renders as the empty value.
    Zero,
}

/// VM lifecycle operations driven by kubevirt jobs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KubeVirtOp {
    /// Start a stopped VM.
    Start,
    /// Stop a running VM.
    Stop,
    /// Restart a VM.
    Restart,
    /// Pause a running VM instance.
    Pause,
    /// Unpause a paused VM instance.
    Unpause,
    /// Live-migrate a VM.
    Migrate,
    /// Hotplug a volume.
    AddVolume,
    /// Unplug a volume.
    RemoveVolume,
}

/// Periodic delete-and-recreate of a fraction of a job's objects.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Churn {
    /// Number of churn cycles to run.
    pub cycles: u32,
    /// Sleep between cycles.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Percentage of iterations churned per cycle.
    pub percent: u8,
}

/// Custom readiness condition checked against `status.conditions`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CustomCondition {
    /// Condition type expected in the status.
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Expected condition status.
    #[serde(default = "default_condition_status")]
    pub status: String,
}

/// How the wait engine polls for an object's readiness.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WaitOptions {
    /// Whether the object is waited on at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// First poll interval.
    #[serde(with = "humantime_serde", default = "default_initial_interval")]
    pub initial_interval: Duration,
    /// Backoff multiplier applied after every poll.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on the poll interval.
    #[serde(with = "humantime_serde", default = "default_max_interval")]
    pub max_interval: Duration,
    /// Readiness condition for kinds without a built-in predicate.
    #[serde(default)]
    pub for_condition: Option<CustomCondition>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: default_initial_interval(),
            multiplier: default_multiplier(),
            max_interval: default_max_interval(),
            for_condition: None,
        }
    }
}

/// A template-backed instruction within a job.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSpec {
    /// Template path, relative to the configuration file.
    #[serde(default)]
    pub object_template: Option<PathBuf>,
    /// Instances dispatched per iteration.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Object kind; derived from the template for create jobs when omitted.
    #[serde(default)]
    pub kind: Option<String>,
    /// API version the kind belongs to.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Extra variables handed to the template; they win over reserved ones.
    #[serde(default)]
    pub input_vars: BTreeMap<String, serde_json::Value>,
    /// Selector for patch, delete, read and check jobs.
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    /// Patch strategy, patch jobs only.
    #[serde(default)]
    pub patch_type: Option<PatchType>,
    /// VM lifecycle operation, kubevirt jobs only.
    #[serde(default)]
    pub kube_virt_op: Option<KubeVirtOp>,
    /// Target a single object by name instead of by selector.
    #[serde(default)]
    pub object_name: Option<String>,
    /// Dispatch exactly once regardless of `jobIterations`.
    #[serde(default)]
    pub run_once: bool,
    /// Readiness polling knobs.
    #[serde(default)]
    pub wait_options: WaitOptions,
}

/// A named unit of work.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job name; also the default namespace prefix.
    pub name: String,
    /// What the job does.
    pub job_type: JobType,
    /// Times the object list is expanded.
    #[serde(default = "default_iterations")]
    pub job_iterations: usize,
    /// Sleep between iterations in sequential mode.
    #[serde(with = "humantime_serde", default)]
    pub job_iteration_delay: Duration,
    /// Sleep after the job finishes, before the next job starts.
    #[serde(with = "humantime_serde", default)]
    pub job_pause: Duration,
    /// Sleep between objects in sequential mode.
    #[serde(with = "humantime_serde", default)]
    pub object_delay: Duration,
    /// Namespace prefix; defaults to the job name.
    #[serde(default)]
    pub namespace: String,
    /// Spread iterations across numbered namespaces.
    #[serde(default)]
    pub namespaced_iterations: bool,
    /// Iterations sharing one namespace when `namespacedIterations` is set.
    #[serde(default = "default_iterations_per_namespace")]
    pub iterations_per_namespace: usize,
    /// Token refill rate of the job's dispatch limiter.
    #[serde(default = "default_qps")]
    pub qps: f64,
    /// Token bucket capacity of the job's dispatch limiter.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Upper bound on readiness waiting and transient retries.
    #[serde(with = "humantime_serde", default = "default_max_wait_timeout")]
    pub max_wait_timeout: Duration,
    /// Wait once for all objects at the end of a parallel job.
    #[serde(default = "default_true")]
    pub wait_when_finished: bool,
    /// Churn settings, create jobs only.
    #[serde(default)]
    pub churn: Option<Churn>,
    /// Parallel or sequential scheduling.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Delete the run's namespaces at teardown.
    #[serde(default)]
    pub cleanup: bool,
    /// Treat AlreadyExists on create as success.
    #[serde(default)]
    pub idempotent: bool,
    /// Renderer behavior for undefined template variables.
    #[serde(default)]
    pub missing_key_policy: MissingKeyPolicy,
    /// Object instructions, expanded in declaration order.
    pub objects: Vec<ObjectSpec>,
}

impl Job {
    /// Namespace the given iteration dispatches into.
    pub fn namespace_for(&self, iteration: usize) -> String {
        if self.namespaced_iterations {
            format!(
                "{}-{}",
                self.namespace,
                iteration / self.iterations_per_namespace.max(1)
            )
        } else {
            self.namespace.clone()
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.objects.is_empty() {
            return Err(Error::Config(format!("job {} has no objects", self.name)));
        }
        if let Some(churn) = &self.churn {
            if churn.percent > 100 {
                return Err(Error::Config(format!(
                    "job {}: churn percent {} exceeds 100",
                    self.name, churn.percent
                )));
            }
            if self.job_type != JobType::Create {
                return Err(Error::Config(format!(
                    "job {}: churn is only supported for create jobs",
                    self.name
                )));
            }
        }
        for object in &self.objects {
            self.validate_object(object)?;
        }
        Ok(())
    }

    fn validate_object(&self, object: &ObjectSpec) -> Result<(), Error> {
        match self.job_type {
            JobType::Create => {
                if object.object_template.is_none() {
                    return Err(Error::Config(format!(
                        "job {}: create objects need an objectTemplate",
                        self.name
                    )));
                }
            }
            JobType::Patch => {
                if object.label_selector.is_empty() {
                    return Err(Error::Config(format!(
                        "job {}: empty labelSelector not allowed with {:?}",
                        self.name, object.kind
                    )));
                }
                if object.patch_type.is_none() {
                    return Err(Error::Config(format!(
                        "job {}: empty patch type not allowed",
                        self.name
                    )));
                }
                if object.object_template.is_none() {
                    return Err(Error::Config(format!(
                        "job {}: patch objects need an objectTemplate",
                        self.name
                    )));
                }
                self.require_kind(object)?;
            }
            JobType::Delete | JobType::Read | JobType::Check => {
                if object.label_selector.is_empty() {
                    return Err(Error::Config(format!(
                        "job {}: empty labelSelector not allowed with {:?}",
                        self.name, object.kind
                    )));
                }
                self.require_kind(object)?;
            }
            JobType::KubeVirt => {
                if object.kube_virt_op.is_none() {
                    return Err(Error::Config(format!(
                        "job {}: kubevirt objects need a kubeVirtOp",
                        self.name
                    )));
                }
                if object.label_selector.is_empty() && object.object_name.is_none() {
                    return Err(Error::Config(format!(
                        "job {}: kubevirt objects need a labelSelector or objectName",
                        self.name
                    )));
                }
                self.require_kind(object)?;
            }
        }
        Ok(())
    }

    fn require_kind(&self, object: &ObjectSpec) -> Result<(), Error> {
        if object.kind.is_none() {
            return Err(Error::Config(format!(
                "job {}: {:?} objects need an explicit kind",
                self.name, self.job_type
            )));
        }
        Ok(())
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_client_qps() -> f64 {
    50.0
}

fn default_client_burst() -> u32 {
    50
}

fn default_step() -> Duration {
    Duration::from_secs(30)
}

fn default_condition_status() -> String {
    "True".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_replicas() -> usize {
    1
}

fn default_api_version() -> String {
    "v1".to_owned()
}

fn default_iterations() -> usize {
    1
}

fn default_iterations_per_namespace() -> usize {
    1
}

fn default_qps() -> f64 {
    20.0
}

fn default_burst() -> u32 {
    20
}

fn default_max_wait_timeout() -> Duration {
    Duration::from_secs(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        let mut config: Config = serde_yaml::from_str(yaml).expect("config should parse");
        config.normalize();
        config
    }

    const FULL: &str = r#"
global:
  requestTimeout: 5s
  clientQps: 10
  clientBurst: 10
  prometheus:
    url: http://prometheus:9090
    step: 1m
jobs:
  - name: storm
    jobType: create
    jobIterations: 10
    qps: 5
    burst: 5
    namespacedIterations: true
    iterationsPerNamespace: 2
    churn:
      cycles: 2
      interval: 30s
      percent: 20
    objects:
      - objectTemplate: pod.yml
        replicas: 5
        inputVars:
          image: busybox
"#;

    #[test]
    fn full_config_round_trips() {
        let config = parse(FULL);
        config.validate().expect("config should validate");
        let job = &config.jobs[0];
        assert_eq!(job.job_type, JobType::Create);
        assert_eq!(job.execution_mode, ExecutionMode::Parallel);
        assert_eq!(job.qps, 5.0);
        assert_eq!(job.objects[0].replicas, 5);
        assert_eq!(job.objects[0].api_version, "v1");
        assert_eq!(
            config.global.prometheus.as_ref().map(|p| p.step),
            Some(Duration::from_secs(60))
        );

        let yaml = serde_yaml::to_string(&config).expect("config should serialize");
        let reloaded = parse(&yaml);
        assert_eq!(reloaded.jobs[0].name, job.name);
        assert_eq!(reloaded.jobs[0].objects[0].replicas, 5);
    }

    #[test]
    fn namespace_defaults_to_job_name() {
        let config = parse(FULL);
        assert_eq!(config.jobs[0].namespace, "storm");
    }

    #[test]
    fn namespaced_iterations_bucket_namespaces() {
        let config = parse(FULL);
        let job = &config.jobs[0];
        assert_eq!(job.namespace_for(0), "storm-0");
        assert_eq!(job.namespace_for(1), "storm-0");
        assert_eq!(job.namespace_for(2), "storm-1");
        assert_eq!(job.namespace_for(9), "storm-4");
    }

    #[test]
    fn shared_namespace_ignores_iteration() {
        let mut config = parse(FULL);
        config.jobs[0].namespaced_iterations = false;
        assert_eq!(config.jobs[0].namespace_for(9), "storm");
    }

    #[test]
    fn patch_requires_selector_and_type() {
        let config = parse(
            r#"
jobs:
  - name: repatch
    jobType: patch
    objects:
      - objectTemplate: patch.yml
        kind: Deployment
        apiVersion: apps/v1
"#,
        );
        let err = config.validate().expect_err("selector is required");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn churn_is_create_only() {
        let config = parse(
            r#"
jobs:
  - name: bad
    jobType: read
    churn:
      cycles: 1
      interval: 1s
      percent: 10
    objects:
      - kind: Pod
        labelSelector: {app: web}
"#,
        );
        assert!(config.validate().is_err());
    }
}

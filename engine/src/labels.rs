use std::collections::BTreeMap;

/// Label carrying the unique id of the run.
pub const RUN_LABEL: &str = "kube-burner-uuid";

/// Label carrying the name of the job that created an object.
pub const JOB_LABEL: &str = "kube-burner-job";

/// Label carrying the iteration that created an object.
pub const ITERATION_LABEL: &str = "kube-burner-index";

/// Label marking objects recreated by the churn loop.
pub const CHURN_LABEL: &str = "kube-burner-churn";

/// Labels stamped on every object the engine creates.
pub fn managed_labels(uuid: &str, job: &str, iteration: usize) -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![
        (RUN_LABEL.to_owned(), uuid.to_owned()),
        (JOB_LABEL.to_owned(), job.to_owned()),
        (ITERATION_LABEL.to_owned(), iteration.to_string()),
    ])
}

/// Labels stamped on namespaces the engine creates.
pub fn namespace_labels(uuid: &str, job: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![
        (RUN_LABEL.to_owned(), uuid.to_owned()),
        (JOB_LABEL.to_owned(), job.to_owned()),
    ])
}

/// Selector matching everything labeled with the run id.
pub fn run_selector(uuid: &str) -> String {
    format!("{RUN_LABEL}={uuid}")
}

/// Selector matching all objects created by a job.
pub fn job_selector(job: &str) -> String {
    format!("{JOB_LABEL}={job}")
}

/// Selector matching the objects a single iteration created.
pub fn iteration_selector(job: &str, iteration: usize) -> String {
    format!("{JOB_LABEL}={job},{ITERATION_LABEL}={iteration}")
}

/// Render a label map as a list-options selector string.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

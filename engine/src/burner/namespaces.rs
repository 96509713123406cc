//! Just-in-time namespace management for namespaced invocations.
use std::collections::HashSet;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::error::Error;
use crate::labels;

/// Tracks which namespaces a job has already ensured.
///
/// The created set is the only cross-invocation mutable state of a job and is
/// guarded by this mutex.
pub struct NamespaceManager {
    client: Client,
    uuid: String,
    job_name: String,
    created: Mutex<HashSet<String>>,
}

impl NamespaceManager {
    /// Create a manager for one job.
    pub fn new(client: Client, uuid: String, job_name: String) -> Self {
        Self {
            client,
            uuid,
            job_name,
            created: Mutex::new(HashSet::new()),
        }
    }

    /// Ensure `name` exists before any invocation dispatches into it.
    pub async fn ensure(&self, name: &str) -> Result<(), Error> {
        {
            let mut created = self
                .created
                .lock()
                .expect("should be able to acquire namespace set lock");
            if !created.insert(name.to_owned()) {
                return Ok(());
            }
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(labels::namespace_labels(&self.uuid, &self.job_name)),
                ..ObjectMeta::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                debug!(namespace = name, "created namespace");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

}

/// Delete every namespace labeled with the run id.
pub(crate) async fn cleanup_run_namespaces(client: Client, uuid: &str) -> Result<(), Error> {
    info!(uuid, "deleting run namespaces");
    let api: Api<Namespace> = Api::all(client);
    let _ = api
        .delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&labels::run_selector(uuid)),
        )
        .await
        .map_err(Error::from)?;
    Ok(())
}

//! Discovery-backed resolution of `(apiVersion, kind)` pairs.
use std::collections::HashMap;

use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;

use crate::error::Error;

/// A resolved REST endpoint for a kind.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    /// Group/version/resource data used to build dynamic APIs.
    pub ar: ApiResource,
    /// Whether the resource lives in namespaces.
    pub namespaced: bool,
}

/// Maps `(apiVersion, kind)` pairs to REST resources.
///
/// Built from the cluster's discovery data once and cached for the life of a
/// run; a pair the cluster does not serve fails with [`Error::UnknownKind`].
pub struct RestMapper {
    by_kind: HashMap<(String, String), ResolvedResource>,
}

impl RestMapper {
    /// Run API discovery once and cache every served resource.
    pub async fn discover(client: Client) -> Result<Self, Error> {
        let discovery = Discovery::new(client)
            .run()
            .await
            .map_err(|err| Error::Other(anyhow::anyhow!("api discovery failed: {err}")))?;
        let mut by_kind = HashMap::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let key = (ar.api_version.clone(), ar.kind.clone());
                by_kind.entry(key).or_insert(ResolvedResource {
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    ar,
                });
            }
        }
        Ok(Self { by_kind })
    }

    /// Build a mapper from a fixed resource list.
    pub fn from_resources(resources: impl IntoIterator<Item = (ApiResource, bool)>) -> Self {
        let by_kind = resources
            .into_iter()
            .map(|(ar, namespaced)| {
                (
                    (ar.api_version.clone(), ar.kind.clone()),
                    ResolvedResource { ar, namespaced },
                )
            })
            .collect();
        Self { by_kind }
    }

    /// Resolve a pair to its REST resource and scope.
    pub fn resolve(&self, api_version: &str, kind: &str) -> Result<&ResolvedResource, Error> {
        self.by_kind
            .get(&(api_version.to_owned(), kind.to_owned()))
            .ok_or_else(|| Error::UnknownKind {
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
            })
    }
}

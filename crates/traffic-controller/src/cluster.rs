use async_trait::async_trait;
use dns_endpoint::DNSEndpoint;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    Api, Client, ResourceExt,
};
use std::fmt;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "traffic-controller";

/// Namespaced identity shared by an Ingress and the DNSEndpoint it owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub namespace: String,
    pub name: String,
}

impl RouteKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self { namespace: obj.namespace().unwrap_or_default(), name: obj.name_any() }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// What the controller needs from the cluster. Getters return `Ok(None)` for
/// objects that do not exist; every other failure is a `kube::Error`.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn list_ingresses(&self) -> Result<Vec<Ingress>, kube::Error>;
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, kube::Error>;
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, kube::Error>;
    async fn get_dns_endpoint(&self, namespace: &str, name: &str) -> Result<Option<DNSEndpoint>, kube::Error>;
    /// Create or replace the fields this controller manages.
    async fn apply_dns_endpoint(&self, endpoint: &DNSEndpoint) -> Result<(), kube::Error>;
    /// Returns `false` when there was nothing to delete.
    async fn delete_dns_endpoint(&self, namespace: &str, name: &str) -> Result<bool, kube::Error>;
}

#[derive(Clone)]
pub struct KubeClusterApi { client: Client }

impl fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("KubeClusterApi").finish() }
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_ingresses(&self) -> Result<Vec<Ingress>, kube::Error> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, kube::Error> {
        Api::<Ingress>::namespaced(self.client.clone(), namespace).get_opt(name).await
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, kube::Error> {
        Api::<Endpoints>::namespaced(self.client.clone(), namespace).get_opt(name).await
    }

    async fn get_dns_endpoint(&self, namespace: &str, name: &str) -> Result<Option<DNSEndpoint>, kube::Error> {
        Api::<DNSEndpoint>::namespaced(self.client.clone(), namespace).get_opt(name).await
    }

    async fn apply_dns_endpoint(&self, endpoint: &DNSEndpoint) -> Result<(), kube::Error> {
        let namespace = endpoint.namespace().unwrap_or_default();
        let api: Api<DNSEndpoint> = Api::namespaced(self.client.clone(), &namespace);
        // Server-side apply creates the object when missing and only touches our fields otherwise.
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&endpoint.name_any(), &params, &Patch::Apply(endpoint)).await?;
        Ok(())
    }

    async fn delete_dns_endpoint(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let api: Api<DNSEndpoint> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::IngressBuilder;

    #[test]
    fn route_key_follows_object_identity() {
        let ing = IngressBuilder::new("cpr-dev", "test-app").build();
        let key = RouteKey::of(&ing);
        assert_eq!(key, RouteKey::new("cpr-dev", "test-app"));
        assert_eq!(key.to_string(), "cpr-dev/test-app");
    }
}

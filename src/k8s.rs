//! Kubernetes bindings for the agent: raw API passthrough, dynamic-object
//! watches and the cluster-info probe. All three share one `kube::Client`
//! built from the in-cluster service account (or the local kubeconfig).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::BodyExt;
use k8s_openapi::api::core::v1::{Namespace, Node};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, WatchEvent, WatchParams,
};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crate::tunnel::client::{ClusterInfoProvider, RequestHandler};
use crate::tunnel::{ApiRequest, ApiResponse, ClusterInfo};
use crate::watch::{ChangeStream, ResourceChange, ResourcePath, WatchError, WatchSource};

/// Request headers never forwarded to the API server. The agent talks to it
/// with its own service-account credentials.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "connection",
    "content-length",
    "cookie",
    "host",
    "transfer-encoding",
];

/// Response headers that describe the agent's HTTP hop, not the payload.
const DROPPED_RESPONSE_HEADERS: &[&str] = &["connection", "content-length", "transfer-encoding"];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid method {0:?}")]
    Method(String),
    #[error("invalid request: {0}")]
    Build(#[from] http::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl ProxyError {
    fn status(&self) -> u16 {
        match self {
            Self::Method(_) | Self::Build(_) => 400,
            Self::Kube(_) | Self::Body(_) => 502,
        }
    }
}

/// Forwards tunnelled requests to the API server unchanged and returns
/// whatever it answers, error statuses included.
#[derive(Clone)]
pub struct KubeRequestHandler {
    client: Client,
}

impl KubeRequestHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn forward(&self, request: ApiRequest) -> Result<ApiResponse, ProxyError> {
        let method = http::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ProxyError::Method(request.method.clone()))?;
        let mut builder = http::Request::builder().method(method).uri(&request.path);
        for (name, value) in forwardable(&request.headers, DROPPED_REQUEST_HEADERS) {
            builder = builder.header(name, value);
        }
        let outbound = builder.body(kube::client::Body::from(request.body))?;

        let response = self.client.send(outbound).await?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?
            .to_bytes();

        let headers = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_string(), value.to_string()))
            })
            .collect::<BTreeMap<_, _>>();
        Ok(ApiResponse {
            id: request.id,
            status: parts.status.as_u16(),
            headers: forwardable(&headers, DROPPED_RESPONSE_HEADERS)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl RequestHandler for KubeRequestHandler {
    async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let id = request.id.clone();
        let method = request.method.clone();
        let path = request.path.clone();
        match self.forward(request).await {
            Ok(response) => {
                debug!(request_id = %id, %method, %path, status = response.status, "Proxied request");
                response
            }
            Err(e) => {
                warn!(request_id = %id, %method, %path, "Proxy failed: {e}");
                ApiResponse::error(id, e.status(), e.to_string())
            }
        }
    }
}

fn forwardable<'a>(
    headers: &'a BTreeMap<String, String>,
    dropped: &'a [&'a str],
) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    headers
        .iter()
        .filter(|(name, _)| !dropped.iter().any(|d| name.eq_ignore_ascii_case(d)))
        .map(|(name, value)| (name.as_str(), value.as_str()))
}

// ─── Watches ─────────────────────────────────────────────────────────────────

/// Opens watches on any collection as `DynamicObject`s.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, path: &ResourcePath) -> Api<DynamicObject> {
        // The kind is never needed to build watch URLs; the plural is.
        let gvk = GroupVersionKind::gvk(&path.group, &path.version, "");
        let resource = ApiResource::from_gvk_with_plural(&gvk, &path.resource);
        match &path.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    async fn open(
        &self,
        path: &ResourcePath,
        resource_version: Option<&str>,
    ) -> Result<ChangeStream, WatchError> {
        let api = self.api_for(path);
        let params = WatchParams::default();
        // "0" lists current objects as ADDED before streaming changes.
        let resource_version = resource_version
            .filter(|rv| !rv.is_empty())
            .unwrap_or("0")
            .to_string();
        debug!(
            api_version = %path.api_version(),
            resource = %path.resource,
            namespace = path.namespace.as_deref().unwrap_or(""),
            resource_version = %resource_version,
            "Opening watch"
        );
        let events = api
            .watch(&params, &resource_version)
            .await
            .map_err(|e| WatchError::Open(e.to_string()))?
            .boxed();

        let resume = Resume {
            api,
            params,
            resource_version,
            events: Some(events),
        };
        Ok(futures::stream::unfold(resume, |mut resume| async move {
            let item = resume.next().await?;
            Some((item, resume))
        })
        .boxed())
    }
}

/// A watch that transparently reopens from the last seen resource version
/// when the API server ends it (server-side watch timeout).
struct Resume {
    api: Api<DynamicObject>,
    params: WatchParams,
    resource_version: String,
    events: Option<BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>>,
}

impl Resume {
    async fn next(&mut self) -> Option<Result<ResourceChange, WatchError>> {
        loop {
            if self.events.is_none() {
                match self.api.watch(&self.params, &self.resource_version).await {
                    Ok(events) => self.events = Some(events.boxed()),
                    Err(e) => return Some(Err(WatchError::Stream(e.to_string()))),
                }
            }
            let next = match self.events.as_mut() {
                Some(events) => events.next().await,
                None => continue,
            };
            match next {
                Some(Ok(event)) => return Some(into_change(event, &mut self.resource_version)),
                Some(Err(e)) => return Some(Err(WatchError::Stream(e.to_string()))),
                None => {
                    debug!(resource_version = %self.resource_version, "Watch ended, resuming");
                    self.events = None;
                }
            }
        }
    }
}

/// Map a native event, tracking the resource version to resume from.
fn into_change(
    event: WatchEvent<DynamicObject>,
    resource_version: &mut String,
) -> Result<ResourceChange, WatchError> {
    let (wrap, obj): (fn(serde_json::Value) -> ResourceChange, DynamicObject) = match event {
        WatchEvent::Added(obj) => (ResourceChange::Added, obj),
        WatchEvent::Modified(obj) => (ResourceChange::Modified, obj),
        WatchEvent::Deleted(obj) => (ResourceChange::Deleted, obj),
        WatchEvent::Bookmark(bookmark) => {
            *resource_version = bookmark.metadata.resource_version;
            return Ok(ResourceChange::Other("BOOKMARK".to_string()));
        }
        WatchEvent::Error(err) => return Err(WatchError::Stream(format!("{err:?}"))),
    };
    if let Some(rv) = obj.metadata.resource_version.as_ref() {
        resource_version.clone_from(rv);
    }
    match serde_json::to_value(&obj) {
        Ok(value) => Ok(wrap(value)),
        Err(e) => {
            warn!(name = %obj.name_any(), "Skipping unserializable object: {e}");
            Ok(ResourceChange::Other("UNSERIALIZABLE".to_string()))
        }
    }
}

// ─── Cluster info ────────────────────────────────────────────────────────────

/// Describes the cluster from the version endpoint, nodes, namespaces and CRDs.
#[derive(Clone)]
pub struct KubeClusterInfo {
    client: Client,
}

impl KubeClusterInfo {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn probe(&self) -> Result<ClusterInfo, kube::Error> {
        let version = self.client.apiserver_version().await?;
        let list = ListParams::default();
        let nodes = Api::<Node>::all(self.client.clone()).list(&list).await?;
        let namespaces = Api::<Namespace>::all(self.client.clone())
            .list(&list)
            .await?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        // Listing CRDs is commonly denied to agents; it's informational only.
        let crds: Vec<String> = match Api::<CustomResourceDefinition>::all(self.client.clone())
            .list(&list)
            .await
        {
            Ok(list) => list.items.iter().map(ResourceExt::name_any).collect(),
            Err(e) => {
                debug!("Skipping CRD listing: {e}");
                Vec::new()
            }
        };

        let provider_id = nodes
            .items
            .iter()
            .find_map(|n| n.spec.as_ref()?.provider_id.as_deref());
        Ok(ClusterInfo {
            platform: detect_platform(&version.git_version, provider_id, &crds).to_string(),
            version: version.git_version,
            node_count: nodes.items.len(),
            namespaces,
            crds,
        })
    }
}

#[async_trait]
impl ClusterInfoProvider for KubeClusterInfo {
    async fn cluster_info(&self) -> Option<ClusterInfo> {
        match self.probe().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Cluster info probe failed: {e}");
                None
            }
        }
    }
}

/// Best-effort distribution guess.
fn detect_platform(git_version: &str, provider_id: Option<&str>, crds: &[String]) -> &'static str {
    if crds.iter().any(|c| c.ends_with(".openshift.io")) {
        return "openshift";
    }
    if git_version.contains("-eks-") {
        return "eks";
    }
    if git_version.contains("-gke.") {
        return "gke";
    }
    if git_version.contains("+k3s") {
        return "k3s";
    }
    if git_version.contains("+rke2") {
        return "rke2";
    }
    match provider_id.and_then(|id| id.split_once("://")).map(|(scheme, _)| scheme) {
        Some("aws") => "eks",
        Some("gce") => "gke",
        Some("azure") => "aks",
        Some("kind") => "kind",
        Some("digitalocean") => "doks",
        _ => "kubernetes",
    }
}

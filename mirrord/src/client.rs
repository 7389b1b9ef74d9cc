use crate::config::MirrorConfig;
use crate::errors::{Error, Result};
use appmirror_api as api;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::DynamicObject as KubeDynamicObject;
use kube::api::ListParams as KubeListParams;
use kube::api::WatchEvent as KubeWatchEvent;
use kube::api::WatchParams as KubeWatchParams;
use kube::error::ErrorResponse as KubeErrorResponse;

/* HTTP 410: the requested resourceVersion is older than the server keeps */
const GONE: u16 = 410;

/* stays below the 295s the apiserver allows for a watch request */
const WATCH_TIMEOUT: u32 = 290;

/*
 * Everything in scope at one point in time, plus the resourceVersion a
 * watch has to start from to see every change made after it.
 */
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub items: Vec<KubeDynamicObject>,
    pub position: String,
}

#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Added(KubeDynamicObject),
    Modified(KubeDynamicObject),
    Deleted(KubeDynamicObject),

    /* no payload, only the resourceVersion the watch has reached */
    Bookmark(String),

    /* a server-side error that did not end the watch */
    Error(KubeErrorResponse),
}

impl ChangeEvent {

    pub fn kind(&self) -> &'static str {
	match self {
	    ChangeEvent::Added(_) => "added",
	    ChangeEvent::Modified(_) => "modified",
	    ChangeEvent::Deleted(_) => "deleted",
	    ChangeEvent::Bookmark(_) => "bookmark",
	    ChangeEvent::Error(_) => "error",
	}
    }
}

pub type EventStream = BoxStream<'static, Result<ChangeEvent>>;

/*
 * A ResourceClient lists and watches one collection of Applications.
 *
 * A single watch() is a single server session: the stream ends when the
 * server closes it and yields an Err when the transport fails. Resuming
 * is up to the caller, which knows the last position it has applied.
 */
#[async_trait]
pub trait ResourceClient: Send + Sync {

    async fn list(&self) -> Result<Snapshot>;

    /*
     * Fails with Error::ResumeExpired, either immediately or as a stream
     * item, when the server no longer has history back to `from`.
     */
    async fn watch(&self, from: &str) -> Result<EventStream>;
}

fn is_gone(resp: &KubeErrorResponse) -> bool {
    resp.code == GONE
}

fn from_watch_event(event: kube::Result<KubeWatchEvent<KubeDynamicObject>>) -> Result<ChangeEvent> {
    match event {
	Ok(KubeWatchEvent::Added(obj)) => Ok(ChangeEvent::Added(obj)),
	Ok(KubeWatchEvent::Modified(obj)) => Ok(ChangeEvent::Modified(obj)),
	Ok(KubeWatchEvent::Deleted(obj)) => Ok(ChangeEvent::Deleted(obj)),
	Ok(KubeWatchEvent::Bookmark(bookmark)) => Ok(ChangeEvent::Bookmark(bookmark.metadata.resource_version)),
	Ok(KubeWatchEvent::Error(resp)) if is_gone(&resp) => Err(Error::ResumeExpired),
	Ok(KubeWatchEvent::Error(resp)) => Ok(ChangeEvent::Error(resp)),
	Err(err) => Err(Error::Connection(err)),
    }
}

/*
 * KubeResourceClient lists and watches argoproj.io/v1alpha1 applications
 * through the kube API server.
 */
#[derive(Clone)]
pub struct KubeResourceClient {
    app_api: KubeApi<KubeDynamicObject>,
}

impl KubeResourceClient {

    pub fn new(kube_client: KubeClient, config: &MirrorConfig) -> Self {
	let ar = api::api_resource();
	let app_api = match config.scope.as_str() {
	    "" => KubeApi::all_with(kube_client, &ar),
	    namespace => KubeApi::namespaced_with(kube_client, namespace, &ar),
	};

	Self{ app_api }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {

    async fn list(&self) -> Result<Snapshot> {
	let list = self.app_api.list(&KubeListParams::default()).await?;
	let position = match list.metadata.resource_version {
	    Some(rv) => rv,
	    None => {
		log::warn!("Application list came back without a resourceVersion, watching from the most recent state");
		String::new()
	    }
	};

	Ok(Snapshot{
	    items: list.items,
	    position,
	})
    }

    async fn watch(&self, from: &str) -> Result<EventStream> {
	let params = KubeWatchParams::default().timeout(WATCH_TIMEOUT);

	match self.app_api.watch(&params, from).await {
	    Ok(stream) => Ok(stream.map(from_watch_event).boxed()),
	    Err(kube::Error::Api(resp)) if is_gone(&resp) => Err(Error::ResumeExpired),
	    Err(err) => Err(Error::Connection(err)),
	}
    }
}

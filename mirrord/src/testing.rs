/*
 * In-memory stand-ins for the cluster and for Redis, used by the engine
 * tests to script sessions and inject failures.
 */
use crate::client::{ChangeEvent, EventStream, ResourceClient, Snapshot};
use crate::errors::{Error, Result};
use crate::store::MirrorStore;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::DynamicObject as KubeDynamicObject;
use kube::error::ErrorResponse as KubeErrorResponse;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;
use tokio::sync::Notify;

pub fn app(namespace: &str, name: &str, project: &str, rv: &str) -> KubeDynamicObject {
    serde_json::from_value(json!({
	"apiVersion": "argoproj.io/v1alpha1",
	"kind": "Application",
	"metadata": {
	    "name": name,
	    "namespace": namespace,
	    "resourceVersion": rv,
	    "managedFields": [{"manager": "argocd-application-controller", "operation": "Update"}]
	},
	"spec": {
	    "project": project,
	    "destination": {"namespace": name, "server": "https://kubernetes.default.svc"}
	}
    })).unwrap()
}

/* an Application whose spec has been torn down already */
pub fn bare_app(namespace: &str, name: &str, rv: &str) -> KubeDynamicObject {
    serde_json::from_value(json!({
	"apiVersion": "argoproj.io/v1alpha1",
	"kind": "Application",
	"metadata": {"name": name, "namespace": namespace, "resourceVersion": rv},
	"spec": {}
    })).unwrap()
}

pub fn unreachable() -> Error {
    Error::Connection(kube::Error::Api(KubeErrorResponse{
	status: String::from("Failure"),
	message: String::from("connection reset by peer"),
	reason: String::from("ServiceUnavailable"),
	code: 503,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub value: String,
    pub ttl: Duration,
}

/*
 * MemoryStore keeps entries in a map and fails every write while
 * `unavailable` is set.
 */
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Stored>>,
    unavailable: Mutex<bool>,
    failing_keys: Mutex<BTreeSet<String>>,
    failing_deletes: Mutex<BTreeMap<String, u32>>,
    lose_writes: Mutex<bool>,
}

impl MemoryStore {

    pub fn with_keys(keys: &[&str]) -> Self {
	let store = Self::default();
	{
	    let mut entries = store.entries.lock().unwrap();
	    for key in keys {
		entries.insert(key.to_string(), Stored{ value: String::from("{}"), ttl: Duration::ZERO });
	    }
	}
	store
    }

    pub fn keys(&self) -> Vec<String> {
	self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn entry(&self, key: &str) -> Option<Stored> {
	self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
	*self.unavailable.lock().unwrap() = unavailable;
    }

    /* only writes touching `key` fail */
    pub fn fail_key(&self, key: &str) {
	self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    /* the next `times` deletes of `key` fail, later ones succeed */
    pub fn fail_deletes(&self, key: &str, times: u32) {
	self.failing_deletes.lock().unwrap().insert(key.to_string(), times);
    }

    /* every set is acknowledged and then thrown away */
    pub fn lose_writes(&self) {
	*self.lose_writes.lock().unwrap() = true;
    }

    fn check(&self, key: &str) -> Result<()> {
	if *self.unavailable.lock().unwrap() || self.failing_keys.lock().unwrap().contains(key) {
	    return Err(Error::StoreUnavailable(String::from("connection refused")));
	}
	Ok(())
    }
}

#[async_trait]
impl MirrorStore for MemoryStore {

    async fn ping(&self) -> Result<()> {
	self.check("")
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
	self.check(key)?;
	if !*self.lose_writes.lock().unwrap() {
	    self.entries.lock().unwrap().insert(key.to_string(), Stored{ value: value.to_string(), ttl });
	}
	Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
	self.check(key)?;
	Ok(self.entries.lock().unwrap().get(key).map(|stored| stored.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
	self.check(key)?;
	if let Some(left) = self.failing_deletes.lock().unwrap().get_mut(key) {
	    if *left > 0 {
		*left -= 1;
		return Err(Error::StoreUnavailable(String::from("connection reset")));
	    }
	}
	self.entries.lock().unwrap().remove(key);
	Ok(())
    }
}

/*
 * One scripted answer to a watch() call.
 */
pub enum Session {
    /* watch() itself fails */
    Refused(Error),

    /* watch() succeeds and yields these items, then the stream closes */
    Events(Vec<Result<ChangeEvent>>),

    /* like Events, but the stream stays open after the last item */
    Hanging(Vec<Result<ChangeEvent>>),
}

/*
 * Yields `events`, then stays open forever and signals `drained` every
 * time it is polled past the end.
 */
fn hanging(events: Vec<Result<ChangeEvent>>, drained: Arc<Notify>) -> EventStream {
    let tail = futures::stream::poll_fn(move |_| {
	drained.notify_one();
	Poll::<Option<Result<ChangeEvent>>>::Pending
    });

    futures::stream::iter(events).chain(tail).boxed()
}

/*
 * ScriptedClient answers list() with queued snapshots (repeating the last
 * one) and watch() with queued sessions. Once the sessions run out every
 * watch hangs. `drained()` resolves once a hanging watch has nothing left
 * to deliver, which is when a test shuts the engine down.
 */
#[derive(Default)]
pub struct ScriptedClient {
    snapshots: Mutex<VecDeque<Result<Snapshot>>>,
    last_snapshot: Mutex<Option<Snapshot>>,
    sessions: Mutex<VecDeque<Session>>,
    lists: Mutex<usize>,
    watched_from: Mutex<Vec<String>>,
    drained: Arc<Notify>,
}

impl ScriptedClient {

    pub fn new(items: Vec<KubeDynamicObject>, position: &str) -> Self {
	let client = Self::default();
	client.push_snapshot(items, position);
	client
    }

    pub fn push_snapshot(&self, items: Vec<KubeDynamicObject>, position: &str) {
	let snapshot = Snapshot{ items, position: position.to_string() };
	self.snapshots.lock().unwrap().push_back(Ok(snapshot));
    }

    pub fn push_list_error(&self, err: Error) {
	self.snapshots.lock().unwrap().push_back(Err(err));
    }

    pub fn push_session(&self, session: Session) {
	self.sessions.lock().unwrap().push_back(session);
    }

    pub fn lists(&self) -> usize {
	*self.lists.lock().unwrap()
    }

    pub fn watched_from(&self) -> Vec<String> {
	self.watched_from.lock().unwrap().clone()
    }

    pub fn drained(&self) -> impl std::future::Future<Output = ()> + 'static {
	let drained = self.drained.clone();
	async move { drained.notified().await }
    }
}

#[async_trait]
impl ResourceClient for ScriptedClient {

    async fn list(&self) -> Result<Snapshot> {
	*self.lists.lock().unwrap() += 1;

	let next = self.snapshots.lock().unwrap().pop_front();
	match next {
	    Some(Ok(snapshot)) => {
		*self.last_snapshot.lock().unwrap() = Some(snapshot.clone());
		Ok(snapshot)
	    },
	    Some(Err(err)) => Err(err),
	    None => match self.last_snapshot.lock().unwrap().clone() {
		Some(snapshot) => Ok(snapshot),
		None => Ok(Snapshot{ items: vec![], position: String::from("1") }),
	    },
	}
    }

    async fn watch(&self, from: &str) -> Result<EventStream> {
	self.watched_from.lock().unwrap().push(from.to_string());

	let next = self.sessions.lock().unwrap().pop_front();
	match next {
	    Some(Session::Refused(err)) => Err(err),
	    Some(Session::Events(events)) => Ok(futures::stream::iter(events).boxed()),
	    Some(Session::Hanging(events)) => Ok(hanging(events, self.drained.clone())),
	    None => Ok(hanging(vec![], self.drained.clone())),
	}
    }
}

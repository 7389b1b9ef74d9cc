use crate::client::{ChangeEvent, EventStream, ResourceClient};
use crate::config::{Backoff, MirrorConfig};
use crate::errors::{Error, Result};
use crate::store::MirrorStore;
use appmirror_api as api;

use futures::StreamExt;
use kube::api::DynamicObject as KubeDynamicObject;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/*
 * The states a SyncEngine moves through:
 *
 *   Initializing -> Syncing -> (ReconnectingWatch)* -> Terminated
 *
 * Relisting is Initializing again, entered when the server can no longer
 * resume the watch from our position.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Initializing,

    Syncing{ position: String, failures: u32 },

    ReconnectingWatch{ position: String, failures: u32 },

    Relisting{ failures: u32 },

    Terminated,
}

/*
 * How a single watch session ended.
 */
enum Outcome {
    Shutdown,
    Closed,
    Expired,
    Failed(Error),
}

/*
 * SyncEngine keeps a MirrorStore in step with the Applications a
 * ResourceClient sees: one full snapshot, then the watch, one event at a
 * time.
 *
 * Keys embed mutable fields (spec.project, the destination), so the engine
 * remembers which key it last wrote for each Application. When an update
 * moves an Application to a new key the old key is deleted first.
 *
 * A key whose delete failed is kept in `orphans` until a later delete
 * succeeds: it is retried before every event and pruned on re-list.
 */
pub struct SyncEngine<C, S> {
    client: C,
    store: S,

    ttl: Duration,
    key_format: api::KeyFormat,
    backoff: Backoff,
    max_reconnects: u32,

    index: HashMap<api::AppRef, String>,
    orphans: BTreeSet<String>,
}

impl<C: ResourceClient, S: MirrorStore> SyncEngine<C, S> {

    pub fn new(client: C, store: S, config: &MirrorConfig) -> Self {
	Self{
	    client,
	    store,
	    ttl: config.ttl,
	    key_format: config.key_format,
	    backoff: config.backoff,
	    max_reconnects: config.max_reconnects,
	    index: HashMap::new(),
	    orphans: BTreeSet::new(),
	}
    }

    /*
     * Runs until `shutdown` resolves (Ok) or the mirror can't be trusted
     * anymore (Err). Errors only come out of the initial snapshot, a
     * re-list that could not be derived or written, or a watch that kept
     * failing past max_reconnects.
     */
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
	F: Future<Output = ()>,
    {
	tokio::pin!(shutdown);
	let mut state = State::Initializing;

	loop {
	    log::trace!("sync engine state: {:?}", state);

	    state = match state {
		State::Initializing => {
		    log::info!("Loading initial snapshot ...");
		    tokio::select! {
			biased;
			_ = shutdown.as_mut() => State::Terminated,
			loaded = self.load_snapshot() => State::Syncing{ position: loaded?, failures: 0 },
		    }
		},

		State::Syncing{ position, failures } => self.sync(position, failures, &mut shutdown).await,

		State::ReconnectingWatch{ position, failures } => {
		    self.check_failures(failures)?;

		    let delay = self.retry_delay(failures);
		    log::info!("Reopening watch from {:?} in {:?}", position, delay);
		    tokio::select! {
			biased;
			_ = shutdown.as_mut() => State::Terminated,
			_ = tokio::time::sleep(delay) => State::Syncing{ position, failures },
		    }
		},

		State::Relisting{ failures } => {
		    self.check_failures(failures)?;

		    let delay = if failures == 0 { Duration::ZERO } else { self.retry_delay(failures) };
		    tokio::select! {
			biased;
			_ = shutdown.as_mut() => State::Terminated,
			loaded = async {
			    tokio::time::sleep(delay).await;
			    self.load_snapshot().await
			} => match loaded {
			    Ok(position) => State::Syncing{ position, failures: 0 },
			    Err(Error::Connection(err)) => {
				log::error!("Unable to re-list applications: {}", err);
				State::Relisting{ failures: failures + 1 }
			    },
			    Err(err) => return Err(err),
			},
		    }
		},

		State::Terminated => {
		    log::info!("Shutting down, mirror holds {} applications", self.index.len());
		    return Ok(());
		},
	    };
	}
    }

    /*
     * The first retry waits the initial backoff, whether it follows an
     * idle close (no failures) or a single failure.
     */
    fn retry_delay(&self, failures: u32) -> Duration {
	self.backoff.delay(failures.saturating_sub(1))
    }

    fn check_failures(&self, failures: u32) -> Result<()> {
	if self.max_reconnects > 0 && failures >= self.max_reconnects {
	    return Err(Error::WatchExhausted(failures));
	}
	Ok(())
    }

    /*
     * Opens one watch session from `position` and applies its events until
     * it ends. Returns the state to move to next.
     */
    async fn sync<F>(&mut self, mut position: String, failures: u32, shutdown: &mut Pin<&mut F>) -> State
    where
	F: Future<Output = ()>,
    {
	let opened = tokio::select! {
	    biased;
	    _ = shutdown.as_mut() => return State::Terminated,
	    opened = self.client.watch(&position) => opened,
	};

	let stream = match opened {
	    Ok(stream) => stream,
	    Err(Error::ResumeExpired) => {
		log::info!("Watch position {:?} expired, re-listing", position);
		return State::Relisting{ failures: 0 };
	    },
	    Err(err) => {
		log::warn!("Unable to open watch from {:?}: {}", position, err);
		return State::ReconnectingWatch{ position, failures: failures + 1 };
	    },
	};

	log::info!("Watching applications from {:?}", position);
	let (outcome, progressed) = self.consume(stream, &mut position, shutdown).await;
	let failures = if progressed { 0 } else { failures };

	match outcome {
	    Outcome::Shutdown => State::Terminated,
	    Outcome::Expired => {
		log::info!("Watch position {:?} expired, re-listing", position);
		State::Relisting{ failures: 0 }
	    },
	    Outcome::Closed => {
		log::debug!("Watch closed at {:?}", position);
		State::ReconnectingWatch{ position, failures }
	    },
	    Outcome::Failed(err) => {
		log::warn!("Watch failed at {:?}: {}", position, err);
		State::ReconnectingWatch{ position, failures: failures + 1 }
	    },
	}
    }

    /*
     * Pulls events off `stream` one at a time. Shutdown is only observed
     * between events, an event that has been received is always applied.
     */
    async fn consume<F>(&mut self, mut stream: EventStream, position: &mut String, shutdown: &mut Pin<&mut F>) -> (Outcome, bool)
    where
	F: Future<Output = ()>,
    {
	let mut progressed = false;

	loop {
	    let next = tokio::select! {
		biased;
		_ = shutdown.as_mut() => return (Outcome::Shutdown, progressed),
		next = stream.next() => next,
	    };

	    match next {
		None => return (Outcome::Closed, progressed),
		Some(Err(Error::ResumeExpired)) => return (Outcome::Expired, progressed),
		Some(Err(err)) => return (Outcome::Failed(err), progressed),
		Some(Ok(event)) => {
		    self.apply(event, position).await;
		    progressed = true;
		},
	    }
	}
    }

    fn advance(position: &mut String, app: &KubeDynamicObject) {
	if let Some(rv) = &app.metadata.resource_version {
	    *position = rv.clone();
	}
    }

    /*
     * Applies one watch event to the store. Nothing in here is fatal: a
     * failure is logged with enough context to reconcile by hand and the
     * TTL bounds how long a missed write can linger.
     */
    async fn apply(&mut self, event: ChangeEvent, position: &mut String) {
	let kind = event.kind();
	self.retry_orphans().await;

	match event {
	    ChangeEvent::Added(app) | ChangeEvent::Modified(app) => {
		Self::advance(position, &app);
		self.upsert(kind, &app).await;
	    },
	    ChangeEvent::Deleted(app) => {
		Self::advance(position, &app);
		self.remove(&app).await;
	    },
	    ChangeEvent::Bookmark(rv) => {
		log::trace!("Bookmark at {:?}", rv);
		*position = rv;
	    },
	    ChangeEvent::Error(resp) => {
		log::warn!("Watch reported an error: {} ({}): {}", resp.reason, resp.code, resp.message);
	    },
	}
    }

    async fn upsert(&mut self, kind: &str, app: &KubeDynamicObject) {
	let (id, entry) = match identify(self.key_format, app) {
	    Ok(derived) => derived,
	    Err(err) => {
		log::error!("Skipping {} event for {}: {}", kind, describe(app), err);
		return;
	    }
	};
	log::debug!("Application {}: {} -> {}", kind, id, entry.key);

	if let Some(previous) = self.index.get(&id) {
	    if *previous != entry.key {
		log::info!("Application {} moved from key {} to {}", id, previous, entry.key);
		if let Err(err) = self.store.delete(previous).await {
		    log::error!("Failed to delete previous key {} of {} on {} event: {}", previous, id, kind, err);
		    self.orphans.insert(previous.clone());
		}
	    }
	}

	if let Err(err) = self.store.set(&entry.key, &entry.value, self.ttl).await {
	    log::error!("Failed to set key {} for {} on {} event: {}", entry.key, id, kind, err);
	}
	/* the key is live again, a pending delete would remove it */
	self.orphans.remove(&entry.key);
	self.index.insert(id, entry.key);
    }

    /*
     * The deleted object's last state usually derives the key it was
     * stored under. When it doesn't (it was torn down part way, or moved
     * without us seeing it) the index still knows.
     */
    async fn remove(&mut self, app: &KubeDynamicObject) {
	let id = match api::AppRef::from_object(app) {
	    Ok(id) => id,
	    Err(err) => {
		log::error!("Skipping deleted event for {}: {}", describe(app), err);
		return;
	    }
	};

	let mut keys = BTreeSet::new();
	match api::derive_key(self.key_format, app) {
	    Ok(key) => { keys.insert(key); },
	    Err(err) => log::debug!("Deleted application {} has no derivable key: {}", id, err),
	}
	if let Some(indexed) = self.index.remove(&id) {
	    keys.insert(indexed);
	}

	if keys.is_empty() {
	    log::error!("Skipping deleted event for {}: no key known for it", id);
	    return;
	}

	for key in keys {
	    log::debug!("Application deleted: {} -> {}", id, key);
	    if let Err(err) = self.store.delete(&key).await {
		log::error!("Failed to delete key {} for {} on deleted event: {}", key, id, err);
		self.orphans.insert(key);
	    }
	}
    }

    /*
     * Reads the last snapshot entry back. A SET that was acknowledged but
     * can't be read (wrong database, a proxy dropping writes) means the
     * mirror isn't being served.
     */
    async fn confirm_snapshot(&self, items: &[KubeDynamicObject]) -> Result<()> {
	let last = match items.last() {
	    Some(app) => identify(self.key_format, app)?.1,
	    None => return Ok(()),
	};

	match self.store.get(&last.key).await? {
	    Some(value) if value == last.value => Ok(()),
	    _ => Err(Error::StoreUnavailable(format!("snapshot entry {} was written but can't be read back", last.key))),
	}
    }

    async fn retry_orphans(&mut self) {
	if self.orphans.is_empty() {
	    return;
	}

	let pending = std::mem::take(&mut self.orphans);
	for key in pending {
	    match self.store.delete(&key).await {
		Ok(()) => log::info!("Deleted orphaned key {}", key),
		Err(err) => {
		    log::warn!("Orphaned key {} still can't be deleted: {}", key, err);
		    self.orphans.insert(key);
		},
	    }
	}
    }

    /*
     * Lists every Application and writes all of them. Any failure leaves
     * the mirror in an unknown state and is returned to the caller.
     *
     * Keys written by an earlier snapshot or watch that the new listing no
     * longer produces belong to Applications deleted while we weren't
     * watching, and are removed.
     */
    async fn load_snapshot(&mut self) -> Result<String> {
	let snapshot = self.client.list().await?;
	log::info!("Listed {} applications at {:?}", snapshot.items.len(), snapshot.position);

	let mut index = HashMap::with_capacity(snapshot.items.len());
	for app in &snapshot.items {
	    let (id, entry) = identify(self.key_format, app).map_err(|err| {
		log::error!("Unable to derive key for {}: {}", describe(app), err);
		err
	    })?;

	    if let Err(err) = self.store.set(&entry.key, &entry.value, self.ttl).await {
		log::error!("Failed to set key {} for {}: {}", entry.key, id, err);
		return Err(err);
	    }
	    index.insert(id, entry.key);
	}
	self.confirm_snapshot(&snapshot.items).await?;

	let current: BTreeSet<&String> = index.values().collect();
	for (id, key) in &self.index {
	    if current.contains(key) {
		continue;
	    }
	    log::info!("Application {} is gone, deleting key {}", id, key);
	    if let Err(err) = self.store.delete(key).await {
		log::error!("Failed to delete stale key {} for {}: {}", key, id, err);
		return Err(err);
	    }
	}

	let orphans = std::mem::take(&mut self.orphans);
	for key in orphans.iter().filter(|key| !current.contains(key)) {
	    log::info!("Deleting orphaned key {}", key);
	    if let Err(err) = self.store.delete(key).await {
		log::error!("Failed to delete orphaned key {}: {}", key, err);
		self.orphans = orphans.clone();
		return Err(err);
	    }
	}

	self.index = index;
	Ok(snapshot.position)
    }
}

fn identify(format: api::KeyFormat, app: &KubeDynamicObject) -> Result<(api::AppRef, api::Entry), api::DeriveError> {
    let id = api::AppRef::from_object(app)?;
    let entry = api::derive_entry(format, app)?;
    Ok((id, entry))
}

fn describe(app: &KubeDynamicObject) -> String {
    format!(
	"{}/{}",
	app.metadata.namespace.as_deref().unwrap_or_default(),
	app.metadata.name.as_deref().unwrap_or("<unnamed>"),
    )
}

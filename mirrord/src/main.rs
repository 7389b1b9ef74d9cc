mod client;
mod config;
mod engine;
mod errors;
mod store;
#[cfg(test)]
mod testing;

use client::KubeResourceClient;
use config::{Args, MirrorConfig};
use engine::SyncEngine;
use errors::Error;
use store::{MirrorStore, RedisStore};

use clap::Parser;
use kube::Client as KubeClient;
use tokio::signal::unix::{signal, SignalKind};

/*
 * Resolves on the first SIGINT, SIGTERM or SIGHUP.
 */
async fn shutdown_signal() {
    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
	(Ok(term), Ok(hup)) => (term, hup),
	_ => {
	    log::warn!("Unable to install SIGTERM/SIGHUP handlers, only CTRL^C will stop us");
	    let _ = tokio::signal::ctrl_c().await;
	    return;
	}
    };

    tokio::select! {
	_ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
	_ = term.recv() => log::info!("Received SIGTERM"),
	_ = hup.recv() => log::info!("Received SIGHUP"),
    }
}

async fn mirror(config: MirrorConfig) -> Result<(), Error> {
    let store = RedisStore::connect(&config).await?;
    store.ping().await?;

    let kube_client = KubeClient::try_default().await?;
    let client = KubeResourceClient::new(kube_client, &config);

    let mut engine = SyncEngine::new(client, store, &config);
    engine.run(shutdown_signal()).await
}

/*
 * mirrord keeps a Redis database in step with the ArgoCD Applications
 * of one namespace:
 *
 *  1. List every Application and write it under its key.
 *  2. Watch from the list's resourceVersion and apply every change.
 *  3. Re-list whenever the watch can't be resumed.
 */
#[tokio::main]
async fn main() {
    env_logger::init();

    let config = MirrorConfig::from(Args::parse());
    log::info!("starting mirrord for namespace {:?}, redis {}/{}, keys {}",
	       config.scope, config.store_address, config.store_index, config.key_format);

    if let Err(err) = mirror(config).await {
	log::error!("mirrord failed: {}", err);
	eprintln!("mirrord: {}", err);
	std::process::exit(1);
    }
    log::info!("mirrord stopped");
}

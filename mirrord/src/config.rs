use appmirror_api::KeyFormat;

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mirrord", version, about = "Mirrors ArgoCD Applications into Redis")]
pub struct Args {

    /// Redis server address
    #[arg(long, default_value = "localhost:16379")]
    pub redis_addr: String,

    /// Redis database number
    #[arg(long, default_value_t = 1)]
    pub redis_db: i64,

    /// Namespace the Applications live in, empty for all namespaces
    #[arg(long, default_value = "argocd")]
    pub argocd_namespace: String,

    /// Expiration of mirrored entries in seconds, 0 keeps them forever
    #[arg(long, default_value_t = 3600)]
    pub ttl: u64,

    /// Key layout: project-name or destination
    #[arg(long, default_value_t = KeyFormat::ProjectName)]
    pub key_format: KeyFormat,

    /// Timeout of a single Redis operation in seconds
    #[arg(long, default_value_t = 5)]
    pub store_timeout: u64,

    /// Consecutive watch failures tolerated before exiting, 0 never gives up
    #[arg(long, default_value_t = 50)]
    pub max_reconnects: u32,
}

/*
 * Exponential backoff between watch reconnects and re-list attempts.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {

    /*
     * The delay before the next attempt, given how many attempts in a
     * row have failed already.
     */
    pub fn delay(&self, failures: u32) -> Duration {
	let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
	self.initial.saturating_mul(factor).min(self.max)
    }

    #[cfg(test)]
    pub fn none() -> Self {
	Self{
	    initial: Duration::ZERO,
	    max: Duration::ZERO,
	}
    }
}

impl Default for Backoff {
    fn default() -> Self {
	Self{
	    initial: Duration::from_secs(1),
	    max: Duration::from_secs(60),
	}
    }
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub store_address: String,
    pub store_index: i64,
    pub store_timeout: Duration,

    /* namespace to mirror, "" mirrors every namespace */
    pub scope: String,

    pub ttl: Duration,
    pub key_format: KeyFormat,
    pub backoff: Backoff,

    /* 0 retries forever */
    pub max_reconnects: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
	Self{
	    store_address: String::from("localhost:16379"),
	    store_index: 1,
	    store_timeout: Duration::from_secs(5),
	    scope: String::from("argocd"),
	    ttl: Duration::from_secs(3600),
	    key_format: KeyFormat::default(),
	    backoff: Backoff::default(),
	    max_reconnects: 50,
	}
    }
}

impl From<Args> for MirrorConfig {
    fn from(args: Args) -> Self {
	Self{
	    store_address: args.redis_addr,
	    store_index: args.redis_db,
	    store_timeout: Duration::from_secs(args.store_timeout),
	    scope: args.argocd_namespace,
	    ttl: Duration::from_secs(args.ttl),
	    key_format: args.key_format,
	    backoff: Backoff::default(),
	    max_reconnects: args.max_reconnects,
	}
    }
}

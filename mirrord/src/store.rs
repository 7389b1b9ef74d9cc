use crate::config::MirrorConfig;
use crate::errors::{Error, Result};

use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::Client as RedisClient;
use std::future::Future;
use std::time::Duration;

/*
 * A MirrorStore is the key-value side of the mirror. A zero ttl stores
 * the value without expiration. Every failure, including a timeout, is
 * reported as Error::StoreUnavailable.
 */
#[async_trait]
pub trait MirrorStore: Send + Sync {

    async fn ping(&self) -> Result<()>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /* readers of the mirror go to Redis directly, the daemon reads back its own snapshot writes */
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/*
 * Builds the SET command, with an EX clause only when the ttl is not
 * zero. Sub-second ttls round up so they never turn into "no expiration".
 */
fn set_cmd(key: &str, value: &str, ttl: Duration) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);

    if !ttl.is_zero() {
	let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
	cmd.arg("EX").arg(secs);
    }
    cmd
}

fn get_cmd(key: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("GET");
    cmd.arg(key);
    cmd
}

fn del_cmd(key: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("DEL");
    cmd.arg(key);
    cmd
}

/*
 * RedisStore talks to a single Redis database through a ConnectionManager,
 * which reconnects on its own after the server goes away.
 */
#[derive(Clone)]
pub struct RedisStore {
    conn: RedisConnectionManager,
    timeout: Duration,
}

impl RedisStore {

    pub fn url(config: &MirrorConfig) -> String {
	format!("redis://{}/{}", config.store_address, config.store_index)
    }

    pub async fn connect(config: &MirrorConfig) -> Result<Self> {
	let client = RedisClient::open(Self::url(config))?;

	let conn = match tokio::time::timeout(config.store_timeout, RedisConnectionManager::new(client)).await {
	    Ok(conn) => conn?,
	    Err(_) => {
		let errmsg = format!("timed out connecting to {}", config.store_address);
		return Err(Error::StoreUnavailable(errmsg));
	    }
	};

	Ok(Self{
	    conn,
	    timeout: config.store_timeout,
	})
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
	F: Future<Output = redis::RedisResult<T>>,
    {
	match tokio::time::timeout(self.timeout, fut).await {
	    Ok(result) => Ok(result?),
	    Err(_) => Err(Error::StoreUnavailable(format!("{} timed out after {:?}", op, self.timeout))),
	}
    }
}

#[async_trait]
impl MirrorStore for RedisStore {

    async fn ping(&self) -> Result<()> {
	let mut conn = self.conn.clone();
	let pong: String = self.bounded("PING", redis::cmd("PING").query_async(&mut conn)).await?;

	log::info!("Connected to Redis: {}", pong);
	Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
	let mut conn = self.conn.clone();
	let cmd = set_cmd(key, value, ttl);
	let _: () = self.bounded("SET", cmd.query_async(&mut conn)).await?;

	Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
	let mut conn = self.conn.clone();
	let cmd = get_cmd(key);
	let value: Option<String> = self.bounded("GET", cmd.query_async(&mut conn)).await?;

	Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
	let mut conn = self.conn.clone();
	let cmd = del_cmd(key);
	let _: () = self.bounded("DEL", cmd.query_async(&mut conn)).await?;

	Ok(())
    }
}

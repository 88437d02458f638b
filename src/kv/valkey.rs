use super::{KvError, KvStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

// ARGV: has_expected, expected, has_new, new
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
if ARGV[3] == '1' then
  redis.call('SET', KEYS[1], ARGV[4])
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Valkey-backed store.
///
/// All keys are namespaced under a configurable prefix so several
/// deployments can share one Valkey. Default prefix: "claimwatch" →
/// keys like "claimwatch:cursor:{address}".
#[derive(Clone)]
pub struct ValkeyStore {
    conn: MultiplexedConnection,
    prefix: String,
    cas: Script,
}

impl ValkeyStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, KvError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            cas: Script::new(CAS_SCRIPT),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Test connectivity.
    pub async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }
}

#[async_trait]
impl KvStore for ValkeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.key(key), value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(self.key(key), member).await?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(self.key(key), member).await?;
        Ok(removed > 0)
    }

    async fn members_of(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(self.key(key)).await?;
        Ok(members)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(self.key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

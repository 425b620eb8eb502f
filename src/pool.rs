//! Keyed pool of idle upstream sockets.
//!
//! Sharded the same way as [`crate::ratelimit`], both descending from the
//! upstream router core's `ShardedLruCache` pattern in
//! `app/gateway_fast.rs`.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

const SHARDS: usize = 16;

type Key = (String, u16);

struct Pooled {
    stream: TcpStream,
    last_used: Instant,
}

struct Shard {
    idle: Mutex<HashMap<Key, VecDeque<Pooled>>>,
}

pub struct ConnectionPool {
    shards: Vec<Shard>,
    max_per_key: usize,
    max_idle: Duration,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_per_key: usize, max_idle: Duration, connect_timeout: Duration) -> Self {
        let shards = (0..SHARDS).map(|_| Shard { idle: Mutex::new(HashMap::new()) }).collect();
        ConnectionPool { shards, max_per_key, max_idle, connect_timeout }
    }

    fn shard_for(&self, key: &Key) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Pops the most recently released live socket for `(host, port)`, or
    /// dials a fresh one with the configured connect timeout.
    pub async fn acquire(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let key = (host.to_string(), port);
        loop {
            let candidate = {
                let shard = self.shard_for(&key);
                let mut idle = shard.idle.lock().unwrap();
                idle.get_mut(&key).and_then(|q| q.pop_back())
            };
            match candidate {
                Some(pooled) if is_alive(&pooled.stream) => return Ok(pooled.stream),
                Some(_) => continue, // dead socket, dropped; try the next one
                None => break,
            }
        }

        let addr = format!("{host}:{port}");
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))),
        }
    }

    /// Returns a socket to the pool if it is still healthy and the per-key
    /// cap has not been reached; otherwise the socket is dropped (closed).
    pub fn release(&self, host: &str, port: u16, stream: TcpStream) {
        if !is_alive(&stream) {
            return;
        }
        let key = (host.to_string(), port);
        let shard = self.shard_for(&key);
        let mut idle = shard.idle.lock().unwrap();
        let queue = idle.entry(key).or_insert_with(VecDeque::new);
        if queue.len() < self.max_per_key {
            queue.push_back(Pooled { stream, last_used: Instant::now() });
        }
    }

    /// Closes sockets that have sat idle longer than `max_idle`.
    pub fn sweep(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut idle = shard.idle.lock().unwrap();
            for queue in idle.values_mut() {
                queue.retain(|pooled| now.duration_since(pooled.last_used) <= self.max_idle);
            }
            idle.retain(|_, queue| !queue.is_empty());
        }
    }

    /// Drops every idle socket. Called during graceful shutdown.
    pub fn shutdown(&self) {
        for shard in &self.shards {
            let mut idle = shard.idle.lock().unwrap();
            idle.clear();
        }
    }
}

/// Approximates the "non-blocking zero-byte peek" liveness probe: a
/// pooled socket is expected to have no pending bytes, so any readable
/// state (EOF or actual data) means it is no longer safely reusable.
fn is_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(0) => false,
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

static INSTANCE: OnceLock<ConnectionPool> = OnceLock::new();

pub fn init(max_per_key: usize, max_idle: Duration, connect_timeout: Duration) {
    let _ = INSTANCE.set(ConnectionPool::new(max_per_key, max_idle, connect_timeout));
}

pub fn get() -> &'static ConnectionPool {
    INSTANCE.get().expect("pool::init must run before pool::get")
}

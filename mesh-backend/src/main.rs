//! mesh-backend - mesh-network stub backend.
//!
//! Exposes the identity / destination / messaging surface of a mesh stack
//! over the bridge without any real networking behind it: hashes are
//! derived deterministically, packet transmission is simulated on a worker
//! thread, and message delivery only works loopback (a send addressed to
//! the local destination lands in the local inbox and announces itself
//! with a `message_received` event). The shape of every operation - names,
//! parameters, results, ordering guards - matches what a real mesh stack
//! would sit behind.

use anyhow::{Context as _, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, Sender};
use hostbridge::{Backend, BackendError, Bridge, Ctx, Deferred, DispatchTable, Params, Reply};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, Level};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mesh-backend")]
#[command(about = "Mesh-network stub backend for the host bridge")]
struct Args {
    /// Enable debug logging (stderr; stdout carries the protocol)
    #[arg(short, long)]
    debug: bool,
}

/// A local node identity. The hash stands in for a real keypair's truncated
/// public-key digest.
struct Identity {
    hash: String,
    created_at: f64,
}

/// An addressable endpoint announced under an identity.
struct Destination {
    hash: String,
    app_name: String,
    aspects: Vec<String>,
}

/// A message sitting in the local inbox.
#[derive(Debug, Clone)]
struct InboundMessage {
    hash: String,
    source: Option<String>,
    title: Option<String>,
    content: String,
    fields: Option<Value>,
    timestamp: f64,
}

impl InboundMessage {
    fn to_json(&self) -> Value {
        json!({
            "hash": self.hash,
            "source": self.source,
            "title": self.title,
            "content": self.content,
            "fields": self.fields,
            "timestamp": self.timestamp,
        })
    }
}

struct MeshBackend {
    initialized: bool,
    identity: Option<Identity>,
    destination: Option<Destination>,
    peers: Vec<String>,
    inbox_tx: Sender<InboundMessage>,
    inbox_rx: Receiver<InboundMessage>,
}

impl Default for MeshBackend {
    fn default() -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        Self {
            initialized: false,
            identity: None,
            destination: None,
            peers: Vec::new(),
            inbox_tx,
            inbox_rx,
        }
    }
}

/// Truncated digest over the given parts, hex-encoded. 16 bytes, the way
/// mesh address hashes are usually presented.
fn derive_hash(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(&hasher.finalize()[..16])
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl MeshBackend {
    /// Install a fresh identity and return its (hash, created_at) snapshot.
    fn new_identity(&mut self) -> (String, f64) {
        let seed = Uuid::new_v4();
        let identity = Identity {
            hash: derive_hash(&[seed.as_bytes()]),
            created_at: unix_time(),
        };
        let snapshot = (identity.hash.clone(), identity.created_at);
        self.identity = Some(identity);
        snapshot
    }

    fn require_initialized(&self) -> Result<(), BackendError> {
        if !self.initialized {
            return Err(BackendError::new(
                "Mesh stack not initialized. Call init() first.",
            ));
        }
        Ok(())
    }

    fn init(&mut self, params: Params) -> Result<Value, BackendError> {
        let config_path: Option<String> = params.get("config_path")?;
        let enable_auto_interface: bool = params.get("enable_auto_interface")?.unwrap_or(true);
        let group_id: String = params
            .get("group_id")?
            .unwrap_or_else(|| "mesh".to_string());

        if let Some(path) = &config_path {
            debug!(config_path = %path, "using config directory");
        }
        if enable_auto_interface {
            info!(group_id = %group_id, "auto interface enabled");
        }

        self.initialized = true;
        let (identity_hash, _) = self.new_identity();
        Ok(json!({
            "status": "initialized",
            "identity_hash": identity_hash,
            "network": format!("MeshStack(group={group_id})"),
        }))
    }

    fn create_identity(&mut self) -> Result<Value, BackendError> {
        let (hash, created_at) = self.new_identity();
        Ok(json!({
            "hash": hash,
            "created_at": created_at,
        }))
    }

    fn load_identity(&mut self, params: Params) -> Result<Value, BackendError> {
        let path: String = params.require("path")?;
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to load identity from '{path}'"))
            .map_err(BackendError::from)?;
        let hash = derive_hash(&[&bytes]);
        self.identity = Some(Identity {
            hash: hash.clone(),
            created_at: unix_time(),
        });
        Ok(json!({
            "hash": hash,
            "loaded_from": path,
        }))
    }

    fn get_identity(&self) -> Result<Value, BackendError> {
        Ok(match &self.identity {
            Some(identity) => json!({ "hash": identity.hash }),
            None => json!({ "hash": null }),
        })
    }

    fn create_destination(&mut self, params: Params) -> Result<Value, BackendError> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            BackendError::new("Identity not initialized. Call init() first.")
        })?;
        let aspects: Vec<String> = params.require("aspects")?;
        let app_name: String = params
            .get("app_name")?
            .unwrap_or_else(|| "mesh".to_string());

        let mut parts: Vec<&[u8]> = vec![identity.hash.as_bytes(), app_name.as_bytes()];
        for aspect in &aspects {
            parts.push(aspect.as_bytes());
        }
        let hash = derive_hash(&parts);
        debug!(destination = %hash, "destination announced");

        self.destination = Some(Destination {
            hash: hash.clone(),
            app_name: app_name.clone(),
            aspects: aspects.clone(),
        });
        Ok(json!({
            "hash": hash,
            "app_name": app_name,
            "aspects": aspects,
        }))
    }

    fn announce(&self, params: Params) -> Result<Value, BackendError> {
        let destination = self.destination.as_ref().ok_or_else(|| {
            BackendError::new("Destination not created. Call create_destination() first.")
        })?;
        let app_data: Option<String> = params.get("app_data")?;
        debug!(
            destination = %destination.hash,
            app = %destination.app_name,
            aspects = destination.aspects.len(),
            app_data = app_data.as_deref().unwrap_or(""),
            "announce"
        );
        Ok(json!({ "status": "announced" }))
    }

    /// Simulated raw packet transmit. The receipt is produced on a worker
    /// thread and handed back as a deferred result - the bridge blocks on
    /// it before responding, like a real send would.
    fn send_packet(&self, params: Params) -> Result<Reply, BackendError> {
        self.require_initialized()?;
        let destination: String = params.require("destination")?;
        let data: String = params.require("data")?;

        let dest_bytes = hex::decode(&destination)
            .map_err(|e| BackendError::new(format!("Invalid destination hash: {e}")))?;
        let data_bytes = hex::decode(&data)
            .map_err(|e| BackendError::new(format!("Invalid packet data: {e}")))?;

        let (tx, deferred) = Deferred::channel();
        std::thread::spawn(move || {
            let packet_hash = derive_hash(&[&dest_bytes, &data_bytes]);
            let _ = tx.send(Ok(json!({
                "status": "delivered",
                "packet_hash": packet_hash,
            })));
        });
        Ok(Reply::Deferred(deferred))
    }

    fn send_message(&mut self, params: Params, ctx: &mut Ctx<'_>) -> Result<Value, BackendError> {
        self.require_initialized()?;
        let destination: String = params.require("destination")?;
        let content: String = params.require("content")?;
        let title: Option<String> = params.get("title")?;
        let fields: Option<Value> = params.get("fields")?;

        let seed = Uuid::new_v4();
        let hash = derive_hash(&[seed.as_bytes(), destination.as_bytes(), content.as_bytes()]);

        // Loopback delivery: a message addressed to our own destination
        // lands in the local inbox and is announced with an event before
        // the queued Response goes out.
        let is_local = self
            .destination
            .as_ref()
            .is_some_and(|dest| dest.hash == destination);
        if is_local {
            let source = self.identity.as_ref().map(|i| i.hash.clone());
            let message = InboundMessage {
                hash: hash.clone(),
                source: source.clone(),
                title,
                content,
                fields,
                timestamp: unix_time(),
            };
            self.inbox_tx
                .send(message)
                .map_err(|_| BackendError::new("Inbox closed"))?;
            ctx.emit_event(
                "message_received",
                json!({ "hash": hash, "source": source }),
            )?;
        }

        Ok(json!({ "hash": hash, "status": "queued" }))
    }

    /// Poll the inbox. Returns the oldest message, or null when nothing
    /// arrives within the timeout - a bounded wait, never an indefinite
    /// block.
    fn receive_message(&self, params: Params) -> Result<Value, BackendError> {
        self.require_initialized()?;
        let timeout_ms: u64 = params.get("timeout")?.unwrap_or(5000);

        match self.inbox_rx.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(message) => Ok(message.to_json()),
            Err(_) => Ok(Value::Null),
        }
    }

    fn get_status(&self) -> Result<Value, BackendError> {
        Ok(json!({
            "available": true,
            "initialized": self.initialized,
            "identity": self.identity.as_ref().map(|i| i.hash.clone()),
            "destination": self.destination.as_ref().map(|d| d.hash.clone()),
            "peers": self.peers.len(),
        }))
    }

    fn get_peers(&self) -> Result<Value, BackendError> {
        Ok(json!(self.peers))
    }
}

impl Backend for MeshBackend {
    fn capabilities(table: &mut DispatchTable<Self>) {
        table.register("init", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.init(p).map(Reply::Value)
        });
        table.register("create_identity", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.create_identity().map(Reply::Value)
        });
        table.register("load_identity", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.load_identity(p).map(Reply::Value)
        });
        table.register("get_identity", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.get_identity().map(Reply::Value)
        });
        table.register("create_destination", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.create_destination(p).map(Reply::Value)
        });
        table.register("announce", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.announce(p).map(Reply::Value)
        });
        table.register("send_packet", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.send_packet(p)
        });
        table.register("send_message", |b: &mut Self, p, ctx: &mut Ctx<'_>| {
            b.send_message(p, ctx).map(Reply::Value)
        });
        table.register("receive_message", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.receive_message(p).map(Reply::Value)
        });
        table.register("get_status", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.get_status().map(Reply::Value)
        });
        table.register("get_peers", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.get_peers().map(Reply::Value)
        });
    }

    fn shutdown(&mut self) -> Result<Value, BackendError> {
        // Tear the stub stack down before the loop stops.
        self.initialized = false;
        self.destination = None;
        while self.inbox_rx.try_recv().is_ok() {}
        Ok(json!({ "status": "shutdown" }))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("starting mesh backend");
    Bridge::stdio(MeshBackend::default()).run()?;
    Ok(())
}

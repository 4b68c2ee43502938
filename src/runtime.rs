//! Session facade over the external sandbox runtime.
//!
//! The pool core only hands out leases; the sandbox itself lives behind
//! [`SandboxBackend`]. Sessions are constructed per request and blocking
//! by design — handlers call them inside `spawn_blocking`, never while
//! holding the pool gate.

use crate::error::{PoolError, Result};
use crate::pool::PoolManager;
use crate::store::VmId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;

/// What a sandbox shows after a reset: the first frame plus the task
/// instruction it was initialized with.
#[derive(Debug, Clone)]
pub struct Observation {
    pub screenshot: Vec<u8>,
    pub instruction: String,
}

/// Result of advancing a sandbox by one action.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub screenshot: Vec<u8>,
    pub done: bool,
    pub reward: f64,
}

/// One live connection to a sandbox, scoped to a leased VM id.
pub trait SandboxSession: Send {
    fn reset(&mut self, task_config: &serde_json::Value) -> Result<Observation>;
    fn step(&mut self, action: &str) -> Result<StepOutcome>;
    fn render(&mut self) -> Result<Vec<u8>>;
    fn evaluate(&mut self) -> Result<f64>;
}

/// Connects sessions to whatever actually runs the sandboxes.
pub trait SandboxBackend: Send + Sync {
    fn connect(&self, vm_id: VmId) -> Result<Box<dyn SandboxSession>>;
}

/// Build a session for a leased VM. Fails with `LeaseNotFound` when the
/// id is not currently leased; each call constructs a fresh handle.
pub fn open_session(
    pool: &PoolManager,
    backend: &dyn SandboxBackend,
    vm_id: VmId,
) -> Result<Box<dyn SandboxSession>> {
    if !pool.is_leased(vm_id)? {
        return Err(PoolError::LeaseNotFound(vm_id));
    }
    backend.connect(vm_id)
}

/// Backend speaking JSON over HTTP to per-VM control servers. VM `n`
/// listens on `base_port + n`, mirroring the per-VM-port layout of the
/// deployment this serves.
pub struct HttpBackend {
    host: String,
    base_port: u16,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(host: String, base_port: u16, timeout: Duration) -> Self {
        Self {
            host,
            base_port,
            timeout,
        }
    }
}

impl SandboxBackend for HttpBackend {
    fn connect(&self, vm_id: VmId) -> Result<Box<dyn SandboxSession>> {
        let port = u32::from(self.base_port) + vm_id;
        let port = u16::try_from(port)
            .map_err(|_| PoolError::Runtime(format!("no control port for VM {}", vm_id)))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| PoolError::Runtime(e.to_string()))?;
        Ok(Box::new(HttpSession {
            client,
            base_url: format!("http://{}:{}", self.host, port),
        }))
    }
}

struct HttpSession {
    client: reqwest::blocking::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ResetReply {
    screenshot: String,
    instruction: String,
}

#[derive(Deserialize)]
struct StepReply {
    screenshot: String,
    done: bool,
    reward: f64,
}

#[derive(Deserialize)]
struct ScreenshotReply {
    screenshot: String,
}

#[derive(Deserialize)]
struct EvaluateReply {
    reward: f64,
}

impl HttpSession {
    fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let reply = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(body)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| PoolError::Runtime(e.to_string()))?;
        reply.json().map_err(|e| PoolError::Runtime(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let reply = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| PoolError::Runtime(e.to_string()))?;
        reply.json().map_err(|e| PoolError::Runtime(e.to_string()))
    }
}

fn decode_frame(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| PoolError::Runtime(format!("bad screenshot payload: {}", e)))
}

impl SandboxSession for HttpSession {
    fn reset(&mut self, task_config: &serde_json::Value) -> Result<Observation> {
        let reply: ResetReply =
            self.post("reset", &serde_json::json!({ "task_config": task_config }))?;
        Ok(Observation {
            screenshot: decode_frame(&reply.screenshot)?,
            instruction: reply.instruction,
        })
    }

    fn step(&mut self, action: &str) -> Result<StepOutcome> {
        let reply: StepReply = self.post("step", &serde_json::json!({ "action": action }))?;
        Ok(StepOutcome {
            screenshot: decode_frame(&reply.screenshot)?,
            done: reply.done,
            reward: reply.reward,
        })
    }

    fn render(&mut self) -> Result<Vec<u8>> {
        let reply: ScreenshotReply = self.get("screenshot")?;
        decode_frame(&reply.screenshot)
    }

    fn evaluate(&mut self) -> Result<f64> {
        let reply: EvaluateReply = self.post("evaluate", &serde_json::json!({}))?;
        Ok(reply.reward)
    }
}

/// Common types and helpers for custody scenarios.
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keyward_protocol::{
    BlobStore, KeyIdentity, KeywardRuntime, MemoryBlobStore, MemoryNetwork, MemoryRepository,
    NewBackupConfig, RuntimeConfig, RuntimeEvent, RuntimeHandle, Steward, VaultId,
};
use tokio::sync::mpsc;

/// How long a scenario waits for any single event.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shape of the custody group a scenario builds.
#[derive(Debug, Clone, Copy)]
pub struct GroupShape {
    pub stewards: usize,
    pub threshold: usize,
}

/// Result of a scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a full scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.into(),
            steps: Vec::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.steps.push(step);
    }

    /// Record a step and report whether it passed, so a scenario can stop
    /// at the first broken precondition.
    pub fn check(&mut self, step: StepResult) -> bool {
        let ok = step.ok;
        self.add(step);
        ok
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let icon = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{icon}] Scenario: {} ({:.1}ms)", self.scenario, self.total_ms);
        eprintln!("  {} passed, {} failed", self.passed, self.failed);
        for step in &self.steps {
            let mark = if step.ok { " ok" } else { "FAIL" };
            eprint!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms);
            if let Some(detail) = &step.detail {
                eprint!(": {detail}");
            }
            eprintln!();
        }
    }

    pub fn emit_jsonl(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{json}");
        }
    }
}

fn step_result(name: &str, start: Instant, outcome: Result<String, String>) -> StepResult {
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(detail) => StepResult {
            step: name.into(),
            ok: true,
            elapsed_ms,
            detail: if detail.is_empty() { None } else { Some(detail) },
        },
        Err(detail) => StepResult {
            step: name.into(),
            ok: false,
            elapsed_ms,
            detail: Some(detail),
        },
    }
}

/// Run a timed synchronous step.
pub fn timed_step<F>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Result<String, String>,
{
    let start = Instant::now();
    step_result(name, start, f())
}

/// Run a timed async step.
pub async fn timed_step_async<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = f().await;
    step_result(name, start, outcome)
}

/// Drain events until `pick` matches one, or time out.
pub async fn wait_event<T>(
    events: &mut mpsc::Receiver<RuntimeEvent>,
    mut pick: impl FnMut(&RuntimeEvent) -> Option<T>,
) -> Result<T, String> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let event = events
                .recv()
                .await
                .ok_or_else(|| "event stream closed".to_string())?;
            if let Some(found) = pick(&event) {
                return Ok(found);
            }
        }
    })
    .await
    .map_err(|_| "timeout".to_string())?
}

/// Poll until `check` returns true, or time out.
pub async fn poll_until<F, Fut>(mut check: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| "timeout".to_string())
}

// ── Devices ─────────────────────────────────────────────────────────────

/// One simulated device running its own runtime.
pub struct Device {
    pub name: String,
    pub handle: RuntimeHandle,
    pub events: mpsc::Receiver<RuntimeEvent>,
}

pub fn spawn_device(
    name: &str,
    seed: u8,
    network: &MemoryNetwork,
    blobs: &MemoryBlobStore,
) -> anyhow::Result<Device> {
    let identity = KeyIdentity::from_seed([seed; 32]);
    let channel = network.connect(identity.identity());
    let blobs: Arc<dyn BlobStore> = Arc::new(blobs.clone());
    let channels = KeywardRuntime::spawn(
        identity,
        channel,
        blobs,
        Box::new(MemoryRepository::new()),
        RuntimeConfig::from_env().with_owner_name(name),
    )?;
    tracing::debug!(device = name, id = %channels.handle.local_id().short(), "device spawned");
    Ok(Device {
        name: name.to_string(),
        handle: channels.handle,
        events: channels.events,
    })
}

/// An owner and its stewards on one in-memory relay.
pub struct Group {
    pub network: MemoryNetwork,
    pub blobs: MemoryBlobStore,
    pub owner: Device,
    pub stewards: Vec<Device>,
    pub vault_id: VaultId,
}

impl Group {
    pub fn spawn(shape: GroupShape, vault: &str) -> anyhow::Result<Self> {
        let network = MemoryNetwork::new();
        let blobs = MemoryBlobStore::new();
        let owner = spawn_device("owner", 1, &network, &blobs)?;
        let stewards = (0..shape.stewards)
            .map(|i| spawn_device(&format!("steward-{}", i + 1), i as u8 + 2, &network, &blobs))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            network,
            blobs,
            owner,
            stewards,
            vault_id: VaultId::from(vault),
        })
    }

    /// Backup config naming every steward by identity.
    pub fn new_config(&self, threshold: usize) -> NewBackupConfig {
        NewBackupConfig {
            vault_id: self.vault_id.clone(),
            threshold,
            stewards: self
                .stewards
                .iter()
                .map(|d| Steward::with_identity(d.handle.local_id(), Some(d.name.clone())))
                .collect(),
            channels: vec!["wss://relay.keyward.local".into()],
            instructions: Some("Only approve a recovery you were told about.".into()),
        }
    }

    pub async fn shutdown(&self) {
        self.owner.handle.shutdown().await;
        for steward in &self.stewards {
            steward.handle.shutdown().await;
        }
    }
}

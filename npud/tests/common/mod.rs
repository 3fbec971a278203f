#![allow(dead_code)]

use npu_common::types::Device;
use npu_common::{FaultPolicyTable, PolicyRegistry};
use npud::{
    DeviceInfoStore, EngineSettings, MemoryBackend, MemoryInventory, PluginEngine, ResetError, ResetExecutor,
    StoreSettings,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

pub const FAULT_CODES: &str = r#"{
    "NotHandleFaultCodes": ["0x80E01801"],
    "RestartBusinessCodes": ["0x80CB8009"],
    "RestartNPUCodes": ["0x8C204E00"],
    "SeparateNPUCodes": ["0x80E18401"],
    "NetworkFaultCodes": {"PreSeparateNPUCodes": ["81078603"]}
}"#;

pub const RESET_CODE: i64 = 0x8C204E00;
pub const ISOLATE_CODE: i64 = 0x80E18401;

pub fn registry() -> Arc<PolicyRegistry> {
    let table = FaultPolicyTable::from_json(FAULT_CODES.as_bytes()).expect("fixture parses");
    Arc::new(PolicyRegistry::with_table(table))
}

pub fn device(id: i32) -> Device {
    Device::new("Ascend910", format!("Ascend910-{id}"), id, id)
}

pub fn fast_store_settings() -> StoreSettings {
    StoreSettings {
        interval: Duration::from_millis(5),
        timeout: Duration::from_millis(50),
        flush_interval: Duration::from_secs(3600),
    }
}

/// Executor that records every device it was asked to reset.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    pub resets: Mutex<Vec<i32>>,
    failures_left: AtomicU32,
}

impl RecordingExecutor {
    pub fn failing(times: u32) -> Self {
        Self {
            resets: Mutex::default(),
            failures_left: AtomicU32::new(times),
        }
    }

    pub fn resets(&self) -> Vec<i32> {
        self.resets.lock().unwrap().clone()
    }
}

impl ResetExecutor for RecordingExecutor {
    async fn reset_device(&self, logical_id: i32) -> Result<(), ResetError> {
        self.resets.lock().unwrap().push(logical_id);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ResetError::Failed {
                logical_id,
                status: "exit status: 1".to_string(),
                stderr: "device busy".to_string(),
            });
        }
        Ok(())
    }
}

/// An engine wired to in-memory collaborators.
pub struct Harness {
    pub inventory: Arc<MemoryInventory>,
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<DeviceInfoStore>,
    pub executor: Arc<RecordingExecutor>,
    pub engine: PluginEngine<MemoryInventory, RecordingExecutor>,
}

pub fn harness(settings: EngineSettings, executor: RecordingExecutor) -> Harness {
    let inventory = Arc::new(MemoryInventory::default());
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(DeviceInfoStore::new(
        backend.clone(),
        settings.node_name.clone(),
        fast_store_settings(),
    ));
    let executor = Arc::new(executor);
    let engine = PluginEngine::new(
        settings,
        inventory.clone(),
        backend.clone(),
        store.clone(),
        registry(),
        executor.clone(),
    )
    .expect("engine builds");
    Harness {
        inventory,
        backend,
        store,
        executor,
        engine,
    }
}

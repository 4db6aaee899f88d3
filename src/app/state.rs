use tracing::{info, warn};

use crate::app::adb::executor::CommandExecutor;
use crate::app::adb::parse::{is_root_detected, parse_model, parse_sdk_version, root_probe_command};
use crate::app::adb::transport::{Connection, Transport, HOST_ROLE};
use crate::app::error::AppError;
use crate::app::events::emit_log;
use crate::app::models::{CommandRequest, DeviceIdentity, LogLevel};
use crate::app::storage::KeyValueStore;

/// Store key holding the JSON array of packages disabled during this session.
pub const DISABLED_PACKAGES_KEY: &str = "mdm_disabled_packages";

/// Only `disabled_packages` survives a restart.
pub struct SessionState {
    connection: Option<Box<dyn Connection>>,
    identity: Option<DeviceIdentity>,
    accounts_clean: bool,
    apk_downloaded: bool,
    disabled_packages: Vec<String>,
    store: Box<dyn KeyValueStore>,
}

impl SessionState {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self {
            connection: None,
            identity: None,
            accounts_clean: false,
            apk_downloaded: false,
            disabled_packages: Vec::new(),
            store,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_mut(&mut self) -> Option<&mut (dyn Connection + 'static)> {
        self.connection.as_deref_mut()
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn accounts_clean(&self) -> bool {
        self.accounts_clean
    }

    pub fn set_accounts_clean(&mut self, clean: bool) {
        self.accounts_clean = clean;
    }

    pub fn apk_downloaded(&self) -> bool {
        self.apk_downloaded
    }

    pub fn set_apk_downloaded(&mut self, downloaded: bool) {
        self.apk_downloaded = downloaded;
    }

    pub fn disabled_packages(&self) -> &[String] {
        &self.disabled_packages
    }

    pub fn attach(&mut self, connection: Box<dyn Connection>) {
        self.connection = Some(connection);
        self.identity = None;
        self.accounts_clean = false;
        self.apk_downloaded = false;
    }

    pub fn connect(
        &mut self,
        transport: &dyn Transport,
        executor: &CommandExecutor<'_>,
        sdk_warning_level: u32,
    ) -> Result<DeviceIdentity, AppError> {
        let trace_id = executor.trace_id();
        if let Some(connection) = &self.connection {
            return Err(AppError::validation(
                format!("Already connected to {}", connection.serial()),
                trace_id,
            ));
        }

        let handle = transport.open(trace_id)?;
        let connection = handle.connect(HOST_ROLE)?;
        info!(trace_id = %trace_id, serial = %connection.serial(), "device connected");
        self.attach(connection);

        let identity = match self.probe_identity(executor, sdk_warning_level) {
            Ok(identity) => identity,
            Err(err) => {
                self.disconnect();
                return Err(err);
            }
        };
        self.restore_disabled_packages(trace_id);
        Ok(identity)
    }

    pub fn disconnect(&mut self) -> bool {
        let was_connected = self.connection.take().is_some();
        self.identity = None;
        self.accounts_clean = false;
        self.apk_downloaded = false;
        was_connected
    }

    /// Reads SDK level, root markers and model. SDK and root checks only warn.
    pub fn probe_identity(
        &mut self,
        executor: &CommandExecutor<'_>,
        sdk_warning_level: u32,
    ) -> Result<DeviceIdentity, AppError> {
        let trace_id = executor.trace_id();
        let observer = executor.observer();

        let sdk_version = executor
            .run(self, &CommandRequest::silent("getprop ro.build.version.sdk", "Reading SDK level"))
            .ok()
            .and_then(|output| parse_sdk_version(&output));
        if let Some(sdk) = sdk_version.filter(|sdk| *sdk >= sdk_warning_level) {
            warn!(trace_id = %trace_id, sdk, "sdk at or above warning level");
            emit_log(
                observer,
                format!("Android SDK {sdk} detected. Provisioning on this version is not fully verified."),
                LogLevel::Warn,
            );
        }

        let root_detected = executor
            .run(self, &CommandRequest::silent(root_probe_command(), "Checking for root"))
            .map(|output| is_root_detected(&output))
            .unwrap_or(false);
        if root_detected {
            warn!(trace_id = %trace_id, "root detected");
            emit_log(
                observer,
                "Root access detected on the device. Device owner provisioning may be unreliable.",
                LogLevel::Warn,
            );
        }

        let model = executor.run(
            self,
            &CommandRequest::silent("getprop ro.product.model", "Reading model"),
        )?;
        let serial = self
            .connection
            .as_ref()
            .map(|connection| connection.serial().to_string())
            .ok_or_else(|| AppError::not_connected(trace_id))?;
        let identity = DeviceIdentity {
            serial,
            model: parse_model(&model),
            sdk_version,
            root_detected,
        };
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Replaces the in-memory list with the persisted one. Malformed data reads as empty.
    pub fn restore_disabled_packages(&mut self, trace_id: &str) -> &[String] {
        let raw = match self.store.get(DISABLED_PACKAGES_KEY) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to read persisted packages");
                None
            }
        };
        self.disabled_packages = raw
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .filter(|packages| !packages.is_empty())
            .unwrap_or_default();
        if !self.disabled_packages.is_empty() {
            info!(
                trace_id = %trace_id,
                count = self.disabled_packages.len(),
                "restored disabled packages"
            );
        }
        &self.disabled_packages
    }

    pub fn record_disabled_package(&mut self, package: &str, trace_id: &str) -> Result<(), AppError> {
        if self.disabled_packages.iter().any(|existing| existing == package) {
            return Ok(());
        }
        self.disabled_packages.push(package.to_string());
        self.persist_disabled_packages(trace_id)
    }

    pub fn clear_disabled_packages(&mut self, trace_id: &str) -> Result<(), AppError> {
        self.disabled_packages.clear();
        self.persist_disabled_packages(trace_id)
    }

    fn persist_disabled_packages(&mut self, trace_id: &str) -> Result<(), AppError> {
        let payload = serde_json::to_string(&self.disabled_packages)
            .map_err(|err| AppError::system(format!("Failed to serialize packages: {err}"), trace_id))?;
        self.store
            .set(DISABLED_PACKAGES_KEY, &payload)
            .map_err(|err| err.with_trace_id(trace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::fake::{FakeDevice, FakeTransport};
    use crate::app::error::ErrorKind;
    use crate::app::events::recording::RecordingObserver;
    use crate::app::storage::{JsonFileStore, MemoryStore};

    fn device() -> FakeDevice {
        FakeDevice::new("S1")
            .reply("getprop ro.build.version.sdk", "33\n")
            .reply("getprop ro.product.model", "Pixel 7\n")
    }

    fn session_with(raw: &str) -> SessionState {
        SessionState::new(Box::new(MemoryStore::default().with_value(DISABLED_PACKAGES_KEY, raw)))
    }

    #[test]
    fn connect_probes_identity_and_restores_packages() {
        let device = device();
        let transport = FakeTransport::new(device.clone());
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = session_with(r#"["com.google.android.gms","com.android.vending"]"#);

        let identity = session.connect(&transport, &executor, 34).expect("connect");
        assert_eq!(identity.serial, "S1");
        assert_eq!(identity.model, "Pixel 7");
        assert_eq!(identity.sdk_version, Some(33));
        assert!(!identity.root_detected);
        assert!(session.is_connected());
        assert_eq!(
            session.disabled_packages(),
            ["com.google.android.gms", "com.android.vending"]
        );
        assert_eq!(device.log().lock().expect("log").roles, vec![HOST_ROLE.to_string()]);
        assert!(observer.logs().is_empty());
    }

    #[test]
    fn high_sdk_and_root_only_warn() {
        let device = FakeDevice::new("S1")
            .reply("getprop ro.build.version.sdk", "34")
            .reply("test -e", "ROOT_FOUND")
            .reply("getprop ro.product.model", "");
        let transport = FakeTransport::new(device);
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = SessionState::new(Box::new(MemoryStore::default()));

        let identity = session.connect(&transport, &executor, 34).expect("connect");
        assert!(identity.root_detected);
        assert_eq!(identity.model, "Generic Android");
        let warnings: Vec<_> = observer
            .logs()
            .into_iter()
            .filter(|(_, level)| *level == LogLevel::Warn)
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(session.is_connected());
    }

    #[test]
    fn failed_probes_do_not_block_connect() {
        let device = FakeDevice::new("S1")
            .fail_open("getprop ro.build.version.sdk", AppError::transport("boom", "fake"))
            .reply("test -e", "Permission denied")
            .reply("getprop ro.product.model", "Pixel");
        let transport = FakeTransport::new(device);
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = SessionState::new(Box::new(MemoryStore::default()));

        let identity = session.connect(&transport, &executor, 34).expect("connect");
        assert_eq!(identity.sdk_version, None);
        assert!(!identity.root_detected);
    }

    #[test]
    fn failed_model_read_drops_the_connection() {
        let device = FakeDevice::new("S1").reply("getprop ro.product.model", "error: closed");
        let transport = FakeTransport::new(device);
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = SessionState::new(Box::new(MemoryStore::default()));

        let err = session.connect(&transport, &executor, 34).expect_err("expected failure");
        assert_eq!(err.kind, ErrorKind::GenericCommand);
        assert!(!session.is_connected());
    }

    #[test]
    fn second_connect_is_rejected() {
        let transport = FakeTransport::new(device());
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = SessionState::new(Box::new(MemoryStore::default()));
        session.connect(&transport, &executor, 34).expect("connect");

        let err = session.connect(&transport, &executor, 34).expect_err("second connect");
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(session.is_connected());
    }

    #[test]
    fn handshake_failure_leaves_session_disconnected() {
        let transport =
            FakeTransport::failing_connect(device(), AppError::known_command("unauthorized", "device unauthorized", "t"));
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = SessionState::new(Box::new(MemoryStore::default()));

        let err = session.connect(&transport, &executor, 34).expect_err("handshake");
        assert_eq!(err.pattern.as_deref(), Some("device unauthorized"));
        assert!(!session.is_connected());
    }

    #[test]
    fn open_failure_leaves_session_disconnected_and_store_untouched() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let path = tmp.path().join("state.json");
        let raw = r#"{"mdm_disabled_packages":"[\"com.a\"]"}"#;
        std::fs::write(&path, raw).expect("seed");
        let device = device();
        let transport = FakeTransport::failing_open(device.clone(), AppError::transport("no adb server", "t"));
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = SessionState::new(Box::new(JsonFileStore::new(&path, "t")));

        let err = session.connect(&transport, &executor, 34).expect_err("open");
        assert_eq!(err.kind, ErrorKind::TransportFault);
        assert!(!session.is_connected());
        assert!(session.identity().is_none());
        assert!(session.disabled_packages().is_empty());
        assert!(device.commands().is_empty());
        assert_eq!(std::fs::read_to_string(&path).expect("state"), raw);
    }

    #[test]
    fn disconnect_resets_ephemeral_flags_but_keeps_packages() {
        let transport = FakeTransport::new(device());
        let observer = RecordingObserver::default();
        let executor = CommandExecutor::new(&observer, "t");
        let mut session = session_with(r#"["com.a"]"#);
        session.connect(&transport, &executor, 34).expect("connect");
        session.set_accounts_clean(true);
        session.set_apk_downloaded(true);

        assert!(session.disconnect());
        assert!(!session.disconnect());
        assert!(!session.accounts_clean());
        assert!(!session.apk_downloaded());
        assert!(session.identity().is_none());
        assert_eq!(session.disabled_packages(), ["com.a"]);
    }

    #[test]
    fn restore_is_idempotent() {
        let mut session = session_with(r#"["com.a","com.b"]"#);
        let first = session.restore_disabled_packages("t").to_vec();
        let second = session.restore_disabled_packages("t").to_vec();
        assert_eq!(first, vec!["com.a".to_string(), "com.b".to_string()]);
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_state_restores_as_empty() {
        for raw in [r#"{"com.a":true}"#, "not json", "[]", "[1,2]", r#""com.a""#] {
            let mut session = session_with(raw);
            assert!(session.restore_disabled_packages("t").is_empty(), "{raw}");
        }
        let mut session = SessionState::new(Box::new(MemoryStore::default()));
        assert!(session.restore_disabled_packages("t").is_empty());
    }

    #[test]
    fn mutations_persist_immediately() {
        let mut session = SessionState::new(Box::new(MemoryStore::default()));
        session.record_disabled_package("com.a", "t").expect("record");
        session.record_disabled_package("com.b", "t").expect("record");
        session.record_disabled_package("com.a", "t").expect("record duplicate");
        assert_eq!(
            session.store.get(DISABLED_PACKAGES_KEY).expect("get").as_deref(),
            Some(r#"["com.a","com.b"]"#)
        );

        session.clear_disabled_packages("t").expect("clear");
        assert_eq!(
            session.store.get(DISABLED_PACKAGES_KEY).expect("get").as_deref(),
            Some("[]")
        );
        assert!(session.restore_disabled_packages("t").is_empty());
    }
}

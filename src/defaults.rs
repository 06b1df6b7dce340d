//! Default values for timeouts, respawn policy and the wire envelope.

pub const DEFAULT_ENGINE: &str = "normal";
pub const WORKER_MODE: &str = "analysis";

pub const REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const TIMEOUT_HINT_FIELD: &str = "maxTime";
pub const TIMEOUT_HINT_SCALE_MS: u64 = 4_000;
pub const TIMEOUT_FLOOR_MS: u64 = 3_000;

pub const RESPAWN_DELAY_MS: u64 = 1_500;
pub const RESPAWN_BACKOFF_FACTOR: f64 = 1.0;
pub const RESPAWN_MAX_DELAY_MS: u64 = 30_000;
pub const STABLE_AFTER_MS: u64 = 30_000;

pub const SHUTDOWN_GRACE_MS: u64 = 5_000;

pub const ID_FIELD: &str = "id";
pub const PARTIAL_FIELD: &str = "isDuringSearch";
pub const ERROR_FIELD: &str = "error";
pub const WARNING_FIELD: &str = "warning";

pub fn default_engine() -> String { DEFAULT_ENGINE.to_string() }
pub fn worker_mode() -> String { WORKER_MODE.to_string() }
pub fn request_timeout_ms() -> u64 { REQUEST_TIMEOUT_MS }
pub fn timeout_hint_field() -> Option<String> { Some(TIMEOUT_HINT_FIELD.to_string()) }
pub fn timeout_hint_scale_ms() -> u64 { TIMEOUT_HINT_SCALE_MS }
pub fn timeout_floor_ms() -> u64 { TIMEOUT_FLOOR_MS }
pub fn respawn_delay_ms() -> u64 { RESPAWN_DELAY_MS }
pub fn respawn_backoff_factor() -> f64 { RESPAWN_BACKOFF_FACTOR }
pub fn respawn_max_delay_ms() -> u64 { RESPAWN_MAX_DELAY_MS }
pub fn stable_after_ms() -> u64 { STABLE_AFTER_MS }
pub fn shutdown_grace_ms() -> u64 { SHUTDOWN_GRACE_MS }
pub fn id_field() -> String { ID_FIELD.to_string() }
pub fn partial_field() -> String { PARTIAL_FIELD.to_string() }
pub fn error_field() -> String { ERROR_FIELD.to_string() }
pub fn warning_field() -> String { WARNING_FIELD.to_string() }

// Application Constants
// Centralized constants for the bin transfer backend

/// Default server configuration
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";

/// Default server port (4403 for bin transfer)
pub const DEFAULT_SERVER_PORT: u16 = 4403;

/// Default CORS origins for development
pub const DEFAULT_CORS_ORIGINS: &str = "*";

/// Default database port (SQL Server)
pub const DEFAULT_DATABASE_PORT: u16 = 1433;

/// Database connection pool defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Lock-wait budget for transfer transactions (milliseconds).
/// Exceeding it surfaces as a retryable Contention error.
pub const LOCK_WAIT_TIMEOUT_MS: i32 = 5000;

/// Quantity tolerance for floating-point comparison (1 milligram).
/// Absolute differences below this are treated as equal.
pub const QUANTITY_TOLERANCE: f64 = 0.001;

/// Sequence name of the bin transfer document series
pub const DOCUMENT_SERIES: &str = "BT";

/// Legacy audit columns cap user ids at 8 characters
pub const USER_ID_MAX_LEN: usize = 8;

/// Transaction types written by the transfer engine
pub const TRAN_TYPE_ISSUE: u8 = 9; // negative adjustment, source leg
pub const TRAN_TYPE_RECEIPT: u8 = 8; // positive adjustment, destination leg

/// Transaction types counted as pending outbound commitment
pub const PENDING_OUTBOUND_TYPES: [u8; 11] = [2, 3, 5, 7, 9, 10, 12, 16, 17, 20, 21];

/// Pool monitoring interval
pub const POOL_MONITOR_INTERVAL_SECS: u64 = 60;
pub const POOL_HIGH_USAGE_THRESHOLD: f64 = 80.0;
pub const POOL_ELEVATED_USAGE_THRESHOLD: f64 = 70.0;

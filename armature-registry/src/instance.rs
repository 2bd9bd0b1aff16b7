//! Instance records and the request/response shapes the transport layer maps onto.

use serde::{Deserialize, Serialize};

/// Status bits.
///
/// `status` is a bitmask, so a fetch may ask for a union such as `UP | DOWN`.
pub mod status {
    /// Instance accepts traffic
    pub const UP: u32 = 1;
    /// Instance is registered but should not receive traffic
    pub const DOWN: u32 = 1 << 1;
    /// Matches every status
    pub const ALL: u32 = u32::MAX;
}

/// One registered service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Environment (e.g. `prod`, `test`)
    pub env: String,

    /// Application identifier
    #[serde(rename = "appId")]
    pub app_id: String,

    /// Unique within the application
    pub hostname: String,

    /// Addresses, in preference order (`host:port` or URL)
    pub addrs: Vec<String>,

    /// Free-form version string
    pub version: String,

    /// Status bitmask
    pub status: u32,

    /// First registration
    pub reg_timestamp: i64,

    /// Continuously up since
    pub up_timestamp: i64,

    /// Last heartbeat
    pub renew_timestamp: i64,

    /// Caller-assigned payload version
    pub dirty_timestamp: i64,

    /// Last structural change seen by this instance
    pub latest_timestamp: i64,
}

impl Instance {
    /// Create an instance with every lifecycle timestamp set to `now`.
    pub fn new(
        env: impl Into<String>,
        app_id: impl Into<String>,
        hostname: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            env: env.into(),
            app_id: app_id.into(),
            hostname: hostname.into(),
            addrs: Vec::new(),
            version: String::new(),
            status: status::UP,
            reg_timestamp: now,
            up_timestamp: now,
            renew_timestamp: now,
            dirty_timestamp: now,
            latest_timestamp: now,
        }
    }

    /// Build an instance from a registration request.
    ///
    /// A zero `dirty_timestamp` in the request means "unversioned" and is
    /// replaced by `now`.
    pub fn from_request(req: &RegisterRequest, now: i64) -> Self {
        let dirty = if req.dirty_timestamp == 0 {
            now
        } else {
            req.dirty_timestamp
        };

        Self {
            addrs: req.addrs.clone(),
            version: req.version.clone(),
            status: req.status,
            dirty_timestamp: dirty,
            ..Self::new(req.env.clone(), req.app_id.clone(), req.hostname.clone(), now)
        }
    }

    /// Add an address
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    /// Set the version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the status bitmask
    pub fn with_status(mut self, status: u32) -> Self {
        self.status = status;
        self
    }

    /// Set the dirty timestamp
    pub fn with_dirty_timestamp(mut self, dirty: i64) -> Self {
        self.dirty_timestamp = dirty;
        self
    }

    /// Set the last heartbeat
    pub fn with_renew_timestamp(mut self, renew: i64) -> Self {
        self.renew_timestamp = renew;
        self
    }

    /// Whether any bit of `mask` is set in this instance's status
    pub fn matches(&self, mask: u32) -> bool {
        mask & self.status != 0
    }

    /// Registry key of the owning application
    pub fn app_key(&self) -> String {
        app_key(&self.app_id, &self.env)
    }
}

/// Registry key for `(app_id, env)`.
pub fn app_key(app_id: &str, env: &str) -> String {
    format!("{}-{}", app_id, env)
}

/// Fetch result: matching instances plus the freshness token to send next time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchData {
    pub instances: Vec<Instance>,
    pub latest_timestamp: i64,
}

/// Registration request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub env: String,
    #[serde(rename = "appid")]
    pub app_id: String,
    pub hostname: String,
    #[serde(default)]
    pub addrs: Vec<String>,
    pub status: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub latest_timestamp: i64,
    #[serde(default)]
    pub dirty_timestamp: i64,
    /// Set when a peer node forwarded the request; reserved for replication
    #[serde(default)]
    pub replication: bool,
}

/// Fetch request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    pub env: String,
    #[serde(rename = "appid")]
    pub app_id: String,
    pub status: u32,
    #[serde(default)]
    pub latest_timestamp: i64,
}

/// Cancel request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    pub env: String,
    #[serde(rename = "appid")]
    pub app_id: String,
    pub hostname: String,
    #[serde(default)]
    pub latest_timestamp: i64,
}

/// Renew request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenewRequest {
    pub env: String,
    #[serde(rename = "appid")]
    pub app_id: String,
    pub hostname: String,
}

//! Common types used across the billing platform

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PlatformError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription plan tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Starter,
    Professional,
    Business,
    Enterprise,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Starter => write!(f, "starter"),
            Self::Professional => write!(f, "professional"),
            Self::Business => write!(f, "business"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "professional" => Ok(Self::Professional),
            "business" => Ok(Self::Business),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(PlatformError::Validation(format!("Invalid plan tier: {}", s))),
        }
    }
}

/// Metered resource a tenant can be billed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Storage,
    Bandwidth,
    VideoCount,
    UserCount,
    ApiCalls,
    Views,
}

impl MetricType {
    /// Every metric, in invoice display order
    pub const ALL: [MetricType; 6] = [
        MetricType::Storage,
        MetricType::Bandwidth,
        MetricType::VideoCount,
        MetricType::UserCount,
        MetricType::ApiCalls,
        MetricType::Views,
    ];

    /// Raw counters for these metrics are bytes and are priced per gigabyte
    pub fn is_byte_metric(&self) -> bool {
        matches!(self, MetricType::Storage | MetricType::Bandwidth)
    }

    /// Unit the overage rate is quoted in
    pub fn billing_unit(&self) -> &'static str {
        match self {
            MetricType::Storage | MetricType::Bandwidth => "GB",
            MetricType::VideoCount => "video",
            MetricType::UserCount => "user",
            MetricType::ApiCalls => "call",
            MetricType::Views => "view",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MetricType::Storage => "storage",
            MetricType::Bandwidth => "bandwidth",
            MetricType::VideoCount => "video_count",
            MetricType::UserCount => "user_count",
            MetricType::ApiCalls => "api_calls",
            MetricType::Views => "views",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MetricType {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "storage" => Ok(Self::Storage),
            "bandwidth" => Ok(Self::Bandwidth),
            "video_count" => Ok(Self::VideoCount),
            "user_count" => Ok(Self::UserCount),
            "api_calls" => Ok(Self::ApiCalls),
            "views" => Ok(Self::Views),
            _ => Err(PlatformError::Validation(format!("Invalid metric type: {}", s))),
        }
    }
}

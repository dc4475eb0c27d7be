//! Result codes reported by the remote billing service.

use serde::{Deserialize, Serialize};

/// Response code attached to every billing service reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    ServiceDisconnected,
    NetworkError,
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }

    /// Stable lowercase name, used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCode::Ok => "ok",
            ResponseCode::UserCanceled => "user_canceled",
            ResponseCode::ServiceUnavailable => "service_unavailable",
            ResponseCode::BillingUnavailable => "billing_unavailable",
            ResponseCode::ItemUnavailable => "item_unavailable",
            ResponseCode::DeveloperError => "developer_error",
            ResponseCode::Error => "error",
            ResponseCode::ItemAlreadyOwned => "item_already_owned",
            ResponseCode::ItemNotOwned => "item_not_owned",
            ResponseCode::ServiceDisconnected => "service_disconnected",
            ResponseCode::NetworkError => "network_error",
        }
    }
}

impl core::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A billing service reply: code plus the service's debug message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingResponse {
    pub code: ResponseCode,
    pub debug_message: String,
}

impl BillingResponse {
    pub fn ok() -> Self {
        Self::new(ResponseCode::Ok, "")
    }

    pub fn new(code: ResponseCode, debug_message: impl Into<String>) -> Self {
        Self {
            code,
            debug_message: debug_message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

impl core::fmt::Display for BillingResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.debug_message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.debug_message)
        }
    }
}

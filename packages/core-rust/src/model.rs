//! Declarative description of providers and service requests.
//!
//! These records are owned by the management plane and read-only to the
//! engine. They deserialize from the catalog JSON shape directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    Action, AuthType, ContentType, PaginationType, ProviderId, ReturnDataType, ScheduleInterval,
    ServiceId, SrId, SrType, TypeParseError, WireFormat,
};

/// Well-known provider property names.
pub mod property_names {
    pub const AUTH_TYPE: &str = "auth_type";
    pub const REQUEST_FORMAT: &str = "request_format";
    pub const RESPONSE_FORMAT: &str = "response_format";
    pub const OAUTH_TOKEN_URL: &str = "oauth_token_url";
    pub const OAUTH_SCOPE: &str = "oauth_scope";
    pub const CLIENT_ID_HEADER: &str = "client_id_header";
}

/// Well-known Sr config item names.
pub mod config_names {
    pub const ENDPOINT: &str = "endpoint";
    pub const REQUEST_METHOD: &str = "request_method";
    pub const HEADERS: &str = "headers";
    pub const BEARER_TOKEN: &str = "bearer_token";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
}

/// Response-key names with engine-defined meaning.
pub mod response_key_names {
    /// Path to the list of items in a LIST response.
    pub const ITEMS_ARRAY: &str = "items_array";
    /// Identity of an extracted item.
    pub const ITEM_ID: &str = "item_id";
    pub const OFFSET: &str = "offset";
    pub const PAGE_NUMBER: &str = "page_number";
    pub const PAGE_SIZE: &str = "page_size";
    pub const TOTAL_ITEMS: &str = "total_items";
    pub const TOTAL_PAGES: &str = "total_pages";

    /// Keys read from the body root into `extra_data`.
    pub const PAGINATION: [&str; 5] = [OFFSET, PAGE_NUMBER, PAGE_SIZE, TOTAL_ITEMS, TOTAL_PAGES];

    /// `true` for keys that are not per-item output fields.
    #[must_use]
    pub fn is_structural(name: &str) -> bool {
        name == ITEMS_ARRAY || PAGINATION.contains(&name)
    }
}

/// A configured third-party API account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Named properties such as `auth_type` and `request_format`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Provider {
    /// Returns a trimmed, non-empty property value.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Declared auth type. An absent property means [`AuthType::None`].
    ///
    /// # Errors
    ///
    /// Returns an error if the property names an unknown scheme.
    pub fn auth_type(&self) -> Result<AuthType, TypeParseError> {
        self.property(property_names::AUTH_TYPE)
            .map_or(Ok(AuthType::None), str::parse)
    }

    /// Declared wire format, `None` when the property is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the property is present but unknown.
    pub fn wire_format(&self) -> Result<Option<WireFormat>, TypeParseError> {
        self.property(property_names::REQUEST_FORMAT)
            .map(str::parse)
            .transpose()
    }

    /// Fallback response content type when the response does not declare one.
    #[must_use]
    pub fn response_format(&self) -> Option<ContentType> {
        self.property(property_names::RESPONSE_FORMAT)
            .and_then(|v| v.parse().ok())
    }
}

/// A named group of service requests, also the dedup category scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// A name/value entry of an array-valued config item (e.g. one header).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPair {
    pub name: String,
    pub value: String,
}

/// One configuration entry scoped to a service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrConfigItem {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub array_value: Vec<ConfigPair>,
}

impl SrConfigItem {
    #[must_use]
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            array_value: Vec::new(),
        }
    }

    #[must_use]
    pub fn pairs(name: impl Into<String>, pairs: Vec<ConfigPair>) -> Self {
        Self {
            name: name.into(),
            value: None,
            array_value: pairs,
        }
    }
}

/// A named template contributing to the request query or body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrParameter {
    pub name: String,
    pub value: String,
}

impl SrParameter {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Maps a logical output field to a location in the response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseKey {
    pub name: String,
    /// Extraction path (dot separated) or, for `page_size`, a literal default.
    pub value: String,
    #[serde(default = "default_true")]
    pub show_in_response: bool,
    /// The value is an array projected element-wise through `array_keys`.
    #[serde(default)]
    pub list_item: bool,
    #[serde(default)]
    pub array_keys: Option<String>,
    #[serde(default)]
    pub prepend_extra_data: bool,
    #[serde(default)]
    pub prepend_extra_data_value: Option<String>,
    #[serde(default)]
    pub append_extra_data: bool,
    #[serde(default)]
    pub append_extra_data_value: Option<String>,
    /// The value triggers chained service requests instead of being output.
    #[serde(default)]
    pub is_service_request: bool,
    #[serde(default)]
    pub return_data_type: Option<ReturnDataType>,
}

impl ResponseKey {
    /// A plain output field read from `path`.
    #[must_use]
    pub fn field(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: path.into(),
            show_in_response: true,
            list_item: false,
            array_keys: None,
            prepend_extra_data: false,
            prepend_extra_data_value: None,
            append_extra_data: false,
            append_extra_data_value: None,
            is_service_request: false,
            return_data_type: None,
        }
    }
}

/// Edge from a response key of one Sr to another Sr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Response-key name whose extracted value triggers the target.
    pub response_key: String,
    pub target_sr_id: SrId,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub disable_request: bool,
    /// Item fields forwarded as the target call's query context.
    #[serde(default)]
    pub request_response_keys: Vec<String>,
}

/// Categories a child Sr overrides instead of inheriting from its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct InheritanceOverrides {
    #[serde(default)]
    pub config: bool,
    #[serde(default)]
    pub parameters: bool,
    #[serde(default)]
    pub response_keys: bool,
    #[serde(default)]
    pub schedule: bool,
    #[serde(default)]
    pub rate_limit: bool,
}

impl InheritanceOverrides {
    /// Every category comes from the child.
    pub const ALL: Self = Self {
        config: true,
        parameters: true,
        response_keys: true,
        schedule: true,
        rate_limit: true,
    };
}

/// Parent-child link of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub parent_id: SrId,
    #[serde(default)]
    pub overrides: InheritanceOverrides,
}

/// When and how a service request is triggered by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrSchedule {
    pub interval: ScheduleInterval,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub execute_immediately: bool,
    /// Query-context values passed to every scheduled run.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// Outbound call budget: at most `max_requests` per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrRateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

/// One declared operation against a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: SrId,
    pub name: String,
    pub provider_id: ProviderId,
    pub service_id: ServiceId,
    #[serde(rename = "type")]
    pub sr_type: SrType,
    #[serde(default)]
    pub pagination_type: PaginationType,
    #[serde(default)]
    pub parent: Option<ParentLink>,
    #[serde(default)]
    pub config: Vec<SrConfigItem>,
    #[serde(default)]
    pub parameters: Vec<SrParameter>,
    #[serde(default)]
    pub response_keys: Vec<ResponseKey>,
    #[serde(default)]
    pub schedule: Option<SrSchedule>,
    #[serde(default)]
    pub rate_limit: Option<SrRateLimit>,
    #[serde(default)]
    pub chain_links: Vec<ChainLink>,
}

impl ServiceRequest {
    /// A bare Sr with no configuration, for builders and tests.
    #[must_use]
    pub fn new(
        id: SrId,
        name: impl Into<String>,
        provider_id: ProviderId,
        service_id: ServiceId,
        sr_type: SrType,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            provider_id,
            service_id,
            sr_type,
            pagination_type: PaginationType::None,
            parent: None,
            config: Vec::new(),
            parameters: Vec::new(),
            response_keys: Vec::new(),
            schedule: None,
            rate_limit: None,
            chain_links: Vec::new(),
        }
    }
}

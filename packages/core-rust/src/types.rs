use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a configured string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct TypeParseError {
    /// Which closed set the value was checked against (e.g. `"auth type"`).
    pub kind: &'static str,
    /// The rejected raw value.
    pub value: String,
}

impl TypeParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a configured third-party [`Provider`](crate::model::Provider).
    ProviderId
);
numeric_id!(
    /// Identifier of a [`Service`](crate::model::Service) grouping service requests.
    ServiceId
);
numeric_id!(
    /// Identifier of a [`ServiceRequest`](crate::model::ServiceRequest).
    SrId
);

/// Shape of the data a service request returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrType {
    #[serde(alias = "LIST")]
    List,
    #[serde(alias = "SINGLE")]
    Single,
    #[serde(alias = "DETAIL")]
    Detail,
}

impl SrType {
    /// `true` when the response yields exactly one item.
    #[must_use]
    pub fn is_single_item(self) -> bool {
        matches!(self, Self::Single | Self::Detail)
    }
}

/// Pagination strategy of a service request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationType {
    #[default]
    None,
    Offset,
    Page,
}

/// Authentication scheme declared on a provider's `auth_type` property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    AccessToken,
    Basic,
    Bearer,
    #[serde(rename = "oauth", alias = "oauth2")]
    OAuth,
}

impl FromStr for AuthType {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "access_token" => Ok(Self::AccessToken),
            "basic" => Ok(Self::Basic),
            "bearer" => Ok(Self::Bearer),
            "oauth" | "oauth2" | "oauth_client_credentials" => Ok(Self::OAuth),
            _ => Err(TypeParseError::new("auth type", s)),
        }
    }
}

/// How parameters travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Parameters become URL query pairs; repeated names are comma-joined.
    QueryString,
    /// Parameter values are space-joined into the request body.
    QuerySchema,
}

impl FromStr for WireFormat {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "query_string" => Ok(Self::QueryString),
            "query_schema" => Ok(Self::QuerySchema),
            _ => Err(TypeParseError::new("request format", s)),
        }
    }
}

/// Decoded body formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Json,
    Xml,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }

    /// Classifies a MIME type such as `application/vnd.api+json; charset=utf-8`.
    #[must_use]
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        let lower = essence.to_ascii_lowercase();
        if lower.ends_with("json") {
            Some(Self::Json)
        } else if lower.ends_with("xml") {
            Some(Self::Xml)
        } else {
            None
        }
    }
}

impl FromStr for ContentType {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            other => Self::from_mime(other).ok_or_else(|| TypeParseError::new("content type", s)),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cast applied to an extracted response-key value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnDataType {
    #[serde(alias = "string")]
    Text,
    #[serde(alias = "int")]
    Integer,
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Array,
    Object,
}

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(TypeParseError::new("request method", s)),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an invocation does with the extracted items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Persist items and follow chain links.
    #[default]
    Store,
    /// Return items to the caller without persisting them (test runs).
    Return,
}

impl FromStr for Action {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "store" => Ok(Self::Store),
            "return" => Ok(Self::Return),
            _ => Err(TypeParseError::new("action", s)),
        }
    }
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Return => "return",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interval at which a scheduled service request fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleInterval {
    EveryMinute,
    EveryHour,
    EveryDay,
    /// Daily, Monday through Friday only.
    EveryWeekday,
    EveryMonth,
}

impl ScheduleInterval {
    pub const ALL: [Self; 5] = [
        Self::EveryMinute,
        Self::EveryHour,
        Self::EveryDay,
        Self::EveryWeekday,
        Self::EveryMonth,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EveryMinute => "every_minute",
            Self::EveryHour => "every_hour",
            Self::EveryDay => "every_day",
            Self::EveryWeekday => "every_weekday",
            Self::EveryMonth => "every_month",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_type_parses_known_values() {
        assert_eq!("BASIC".parse::<AuthType>().unwrap(), AuthType::Basic);
        assert_eq!("".parse::<AuthType>().unwrap(), AuthType::None);
        assert_eq!("oauth2".parse::<AuthType>().unwrap(), AuthType::OAuth);
        assert_eq!(
            "access_token".parse::<AuthType>().unwrap(),
            AuthType::AccessToken
        );
    }

    #[test]
    fn auth_type_rejects_unknown_value() {
        let err = "kerberos".parse::<AuthType>().unwrap_err();
        assert_eq!(err.kind, "auth type");
        assert_eq!(err.value, "kerberos");
    }

    #[test]
    fn wire_format_is_strict() {
        assert_eq!(
            "query_string".parse::<WireFormat>().unwrap(),
            WireFormat::QueryString
        );
        assert_eq!(
            "Query_Schema".parse::<WireFormat>().unwrap(),
            WireFormat::QuerySchema
        );
        assert!("form".parse::<WireFormat>().is_err());
    }

    #[test]
    fn content_type_from_mime() {
        assert_eq!(
            ContentType::from_mime("application/json; charset=utf-8"),
            Some(ContentType::Json)
        );
        assert_eq!(
            ContentType::from_mime("application/hal+json"),
            Some(ContentType::Json)
        );
        assert_eq!(ContentType::from_mime("text/xml"), Some(ContentType::Xml));
        assert_eq!(ContentType::from_mime("text/html"), None);
    }

    #[test]
    fn sr_type_accepts_upper_and_lower_case() {
        let upper: SrType = serde_json::from_str("\"LIST\"").unwrap();
        let lower: SrType = serde_json::from_str("\"detail\"").unwrap();
        assert_eq!(upper, SrType::List);
        assert_eq!(lower, SrType::Detail);
        assert!(lower.is_single_item());
    }

    #[test]
    fn http_method_parses_case_insensitively() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!(" Post ".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert!("FETCH".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = SrId(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!(id.to_string(), "42");
    }
}

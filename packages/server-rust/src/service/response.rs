//! Response extraction: decode a transport response and project it through
//! the Sr's response keys into items plus pagination `extra_data`.

use opflow_core::model::response_key_names;
use opflow_core::template::value_to_text;
use opflow_core::{ContentType, EffectiveServiceRequest, Provider, ResponseKey, ReturnDataType, SrType};
use serde_json::{Map, Value};

use crate::service::operation::OperationError;
use crate::service::xml::xml_to_json;
use crate::transport::{HttpRequest, HttpResponse};

/// Identity field of a raw item when the Sr configures no `item_id` key.
const RAW_ID: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Error,
}

/// One structured item extracted from a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedItem {
    /// Value of the `item_id` response key, or the raw `id` when no such
    /// key is configured.
    pub item_id: Option<Value>,
    /// Output fields (`show_in_response`).
    pub fields: Map<String, Value>,
    /// Extracted but not shown; still available for chain forwarding.
    pub hidden: Map<String, Value>,
    /// Values of `is_service_request` keys, consumed by chain links.
    pub triggers: Map<String, Value>,
}

impl ExtractedItem {
    /// Looks a field up across output, hidden and trigger values.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .get(name)
            .or_else(|| self.hidden.get(name))
            .or_else(|| self.triggers.get(name))
    }
}

/// Items of one response, shaped by the Sr type.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    Empty,
    Single(Box<ExtractedItem>),
    List(Vec<ExtractedItem>),
}

impl RequestData {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Single(_) => false,
            Self::List(items) => items.is_empty(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Single(_) => 1,
            Self::List(items) => items.len(),
        }
    }

    #[must_use]
    pub fn into_items(self) -> Vec<ExtractedItem> {
        match self {
            Self::Empty => Vec::new(),
            Self::Single(item) => vec![*item],
            Self::List(items) => items,
        }
    }
}

/// Runtime result of one request: extracted items plus diagnostics.
#[derive(Debug, Clone)]
pub struct OperationResponse {
    pub status: ResponseStatus,
    pub http_status: u16,
    pub content_type: Option<ContentType>,
    pub request_data: RequestData,
    /// Pagination metadata read from the body root.
    pub extra_data: Map<String, Value>,
    pub request: HttpRequest,
    pub raw_body: String,
}

impl OperationResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Projects decoded bodies through an Sr's response keys.
pub struct ResponseExtractor<'a> {
    sr: &'a EffectiveServiceRequest,
    provider: &'a Provider,
}

impl<'a> ResponseExtractor<'a> {
    #[must_use]
    pub fn new(sr: &'a EffectiveServiceRequest, provider: &'a Provider) -> Self {
        Self { sr, provider }
    }

    /// Decodes `response` and extracts items and `extra_data`.
    ///
    /// A non-2xx status yields an `Error` response with no items rather than
    /// an `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Extraction`] when the content type is
    /// unknown or the body cannot be decoded.
    pub fn extract(
        &self,
        request: HttpRequest,
        response: &HttpResponse,
    ) -> Result<OperationResponse, OperationError> {
        let raw_body = String::from_utf8_lossy(&response.body).to_string();
        let content_type = response
            .content_type()
            .or_else(|| self.provider.response_format());

        let mut out = OperationResponse {
            status: ResponseStatus::Success,
            http_status: response.status,
            content_type,
            request_data: RequestData::Empty,
            extra_data: Map::new(),
            request,
            raw_body,
        };
        if !response.is_success() {
            out.status = ResponseStatus::Error;
            return Ok(out);
        }

        let Some(content_type) = content_type else {
            return Err(OperationError::Extraction(format!(
                "unsupported content type {:?} from {}",
                response.header("content-type").unwrap_or_default(),
                out.request.redacted_url(self.provider)
            )));
        };
        if out.raw_body.trim().is_empty() {
            return Ok(out);
        }
        let body = decode(content_type, &out.raw_body)?;

        out.extra_data = self.extra_data(&body);
        out.request_data = self.request_data(&body);
        Ok(out)
    }

    fn extra_data(&self, body: &Value) -> Map<String, Value> {
        let mut extra = Map::new();
        for name in response_key_names::PAGINATION {
            let Some(key) = self.sr.response_key(name) else {
                continue;
            };
            if let Some(value) = lookup_path(body, &key.value).filter(|v| !v.is_null()) {
                extra.insert(name.to_string(), value.clone());
            }
        }
        extra
    }

    fn request_data(&self, body: &Value) -> RequestData {
        let container = match self.sr.response_key(response_key_names::ITEMS_ARRAY) {
            Some(key) => lookup_path(body, &key.value),
            None => Some(body),
        };
        let raw_items: Vec<&Value> = match container {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(v @ Value::Object(_)) => vec![v],
            _ => Vec::new(),
        };

        match self.sr.sr_type {
            SrType::List => RequestData::List(
                raw_items.into_iter().map(|raw| self.extract_item(raw)).collect(),
            ),
            SrType::Single | SrType::Detail => match raw_items.first() {
                Some(raw) => RequestData::Single(Box::new(self.extract_item(raw))),
                None => RequestData::Empty,
            },
        }
    }

    /// Projects one raw item through the field keys. An Sr without field
    /// keys passes the raw object through unchanged. Without an `item_id`
    /// key the raw item's `id` is its identity.
    fn extract_item(&self, raw: &Value) -> ExtractedItem {
        let mut item = ExtractedItem::default();
        let mut has_field_keys = false;
        let mut has_id_key = false;
        for key in &self.sr.response_keys {
            if response_key_names::is_structural(&key.name) {
                continue;
            }
            has_field_keys = true;
            has_id_key |= key.name == response_key_names::ITEM_ID;
            let Some(value) = extract_value(raw, key) else {
                continue;
            };
            if key.name == response_key_names::ITEM_ID {
                item.item_id = Some(value.clone());
            }
            if key.is_service_request {
                item.triggers.insert(key.name.clone(), value);
            } else if key.show_in_response {
                item.fields.insert(key.name.clone(), value);
            } else {
                item.hidden.insert(key.name.clone(), value);
            }
        }

        if !has_field_keys {
            if let Value::Object(map) = raw {
                item.fields = map.clone();
            }
        }
        if !has_id_key {
            item.item_id = raw.get(RAW_ID).filter(|v| !v.is_null()).cloned();
        }
        item
    }
}

fn decode(content_type: ContentType, body: &str) -> Result<Value, OperationError> {
    match content_type {
        ContentType::Json => serde_json::from_str(body)
            .map_err(|e| OperationError::Extraction(format!("invalid JSON body: {e}"))),
        ContentType::Xml => {
            xml_to_json(body).map_err(|e| OperationError::Extraction(format!("invalid XML body: {e}")))
        }
    }
}

/// Applies one response key to an item.
fn extract_value(item: &Value, key: &ResponseKey) -> Option<Value> {
    let found = lookup_path(item, &key.value)?;
    if found.is_null() {
        return None;
    }

    let projected = if key.list_item {
        let elements = match found {
            Value::Array(elements) => elements.iter().collect::<Vec<_>>(),
            other => vec![other],
        };
        let values = elements
            .into_iter()
            .filter_map(|el| match key.array_keys.as_deref() {
                Some(path) => lookup_path(el, path).cloned(),
                None => Some(el.clone()),
            })
            .filter(|v| !v.is_null())
            .map(|v| decorate(v, key))
            .collect();
        Value::Array(values)
    } else {
        let value = match key.array_keys.as_deref() {
            Some(path) => lookup_path(found, path)?.clone(),
            None => found.clone(),
        };
        decorate(value, key)
    };

    Some(match key.return_data_type {
        Some(ty) => cast(projected, ty),
        None => projected,
    })
}

/// Applies the prepend/append literals to a scalar value.
fn decorate(value: Value, key: &ResponseKey) -> Value {
    let prepend = key
        .prepend_extra_data_value
        .as_deref()
        .filter(|_| key.prepend_extra_data);
    let append = key
        .append_extra_data_value
        .as_deref()
        .filter(|_| key.append_extra_data);
    if (prepend.is_none() && append.is_none()) || value.is_array() || value.is_object() {
        return value;
    }
    Value::String(format!(
        "{}{}{}",
        prepend.unwrap_or_default(),
        value_to_text(&value),
        append.unwrap_or_default()
    ))
}

/// Resolves a dot-separated path (`a.b.0.c`) or a JSON pointer (`/a/b/0`).
/// An empty path, `.` or `$` is the value itself.
#[must_use]
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let path = path.trim();
    if path.is_empty() || path == "." || path == "$" {
        return Some(value);
    }
    if path.starts_with('/') {
        return value.pointer(path);
    }
    let path = path.strip_prefix("$.").unwrap_or(path);
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Casts a value to a declared return type. Values that cannot be cast are
/// returned unchanged.
#[must_use]
pub fn cast(value: Value, ty: ReturnDataType) -> Value {
    try_cast(&value, ty).unwrap_or(value)
}

fn try_cast(value: &Value, ty: ReturnDataType) -> Option<Value> {
    match (ty, value) {
        (ReturnDataType::Text, Value::String(_)) => None,
        (ReturnDataType::Text, other) => Some(Value::String(value_to_text(other))),
        (ReturnDataType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => None,
        (ReturnDataType::Integer, Value::Number(n)) => {
            n.as_f64().and_then(float_to_i64).map(Value::from)
        }
        (ReturnDataType::Integer, Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(float_to_i64))
                .map(Value::from)
        }
        (ReturnDataType::Integer, Value::Bool(b)) => Some(Value::from(i64::from(*b))),
        (ReturnDataType::Float, Value::Number(n)) => n.as_f64().map(Value::from),
        (ReturnDataType::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
        (ReturnDataType::Boolean, Value::Number(n)) => {
            Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)))
        }
        (ReturnDataType::Boolean, Value::String(s)) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" | "" => Some(Value::Bool(false)),
                _ => None,
            }
        }
        (ReturnDataType::Array, Value::Array(_)) => None,
        (ReturnDataType::Array, Value::Null) => Some(Value::Array(Vec::new())),
        (ReturnDataType::Array, other) => Some(Value::Array(vec![other.clone()])),
        (ReturnDataType::Object, Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Object(_)) => Some(parsed),
            _ => None,
        },
        _ => None,
    }
}

// Finite values are truncated toward zero; the range check keeps the cast exact.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_i64(f: f64) -> Option<i64> {
    (f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64).then(|| f.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use opflow_core::{ProviderId, ServiceId, ServiceRequest, SrId};
    use serde_json::json;

    use super::*;
    use crate::transport::HttpResponse;

    fn provider(response_format: Option<&str>) -> Provider {
        let mut properties = BTreeMap::new();
        if let Some(f) = response_format {
            properties.insert("response_format".to_string(), f.to_string());
        }
        Provider {
            id: ProviderId(1),
            name: "p".to_string(),
            base_url: "https://x.test".to_string(),
            access_key: None,
            secret_key: None,
            user_id: None,
            properties,
        }
    }

    fn sr(sr_type: SrType, keys: Vec<ResponseKey>) -> EffectiveServiceRequest {
        let mut sr = ServiceRequest::new(SrId(1), "s", ProviderId(1), ServiceId(1), sr_type);
        sr.response_keys = keys;
        EffectiveServiceRequest::standalone(&sr)
    }

    fn request() -> HttpRequest {
        HttpRequest::new(opflow_core::HttpMethod::Get, "https://x.test/s")
    }

    #[test]
    fn items_pass_through_when_only_items_array_is_configured() {
        let s = sr(SrType::List, vec![ResponseKey::field("items_array", "results")]);
        let p = provider(None);
        let resp = HttpResponse::json(200, &json!({"results": [{"id": 1, "name": "a"}, {"name": "b"}]}));
        let items = ResponseExtractor::new(&s, &p)
            .extract(request(), &resp)
            .unwrap()
            .request_data
            .into_items();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_id, Some(json!(1)));
        assert_eq!(items[0].fields["id"], json!(1));
        assert_eq!(items[0].fields["name"], json!("a"));
        assert_eq!(items[1].item_id, None);
    }

    #[test]
    fn configured_item_id_key_wins_over_raw_id() {
        let s = sr(
            SrType::List,
            vec![
                ResponseKey::field("items_array", "results"),
                ResponseKey::field("item_id", "uid"),
            ],
        );
        let p = provider(None);
        let resp = HttpResponse::json(200, &json!({"results": [{"id": 1, "uid": "u-9"}, {"id": 2}]}));
        let items = ResponseExtractor::new(&s, &p)
            .extract(request(), &resp)
            .unwrap()
            .request_data
            .into_items();

        assert_eq!(items[0].item_id, Some(json!("u-9")));
        assert!(items[0].fields.get("name").is_none());
        assert_eq!(items[1].item_id, None);
    }

    #[test]
    fn list_items_come_from_items_array() {
        let s = sr(
            SrType::List,
            vec![
                ResponseKey::field("items_array", "results"),
                ResponseKey::field("item_id", "id"),
                ResponseKey::field("title", "name"),
                ResponseKey::field("total_items", "meta.total"),
            ],
        );
        let p = provider(None);
        let resp = HttpResponse::json(
            200,
            &json!({"meta": {"total": 2}, "results": [{"id": 1, "name": "a"}, {"id": 2}]}),
        );
        let out = ResponseExtractor::new(&s, &p).extract(request(), &resp).unwrap();

        assert!(out.is_success());
        assert_eq!(out.extra_data["total_items"], json!(2));
        let items = out.request_data.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_id, Some(json!(1)));
        assert_eq!(items[0].fields["title"], json!("a"));
        assert!(items[1].fields.get("title").is_none());
    }

    #[test]
    fn root_array_without_items_array_key() {
        let s = sr(SrType::List, vec![ResponseKey::field("item_id", "id")]);
        let p = provider(None);
        let resp = HttpResponse::json(200, &json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]));
        let out = ResponseExtractor::new(&s, &p).extract(request(), &resp).unwrap();
        assert_eq!(out.request_data.len(), 3);
    }

    #[test]
    fn single_sr_yields_one_item() {
        let s = sr(SrType::Detail, vec![ResponseKey::field("item_id", "data.id")]);
        let p = provider(None);
        let resp = HttpResponse::json(200, &json!({"data": {"id": 9}}));
        let out = ResponseExtractor::new(&s, &p).extract(request(), &resp).unwrap();
        match out.request_data {
            RequestData::Single(item) => assert_eq!(item.item_id, Some(json!(9))),
            other => panic!("expected single item, got {other:?}"),
        }
    }

    #[test]
    fn non_success_status_is_an_error_response() {
        let s = sr(SrType::List, Vec::new());
        let p = provider(None);
        let resp = HttpResponse::json(500, &json!({"error": "boom"}));
        let out = ResponseExtractor::new(&s, &p).extract(request(), &resp).unwrap();
        assert_eq!(out.status, ResponseStatus::Error);
        assert!(out.request_data.is_empty());
    }

    #[test]
    fn unknown_content_type_is_an_extraction_error() {
        let s = sr(SrType::List, Vec::new());
        let p = provider(None);
        let resp = HttpResponse::new(200, "<html/>").with_header("content-type", "text/html");
        let err = ResponseExtractor::new(&s, &p).extract(request(), &resp).unwrap_err();
        assert!(matches!(err, OperationError::Extraction(_)));
    }

    #[test]
    fn provider_response_format_is_the_fallback() {
        let s = sr(
            SrType::List,
            vec![
                ResponseKey::field("items_array", "items.item"),
                ResponseKey::field("item_id", "@id"),
                ResponseKey::field("total_pages", "pages"),
            ],
        );
        let p = provider(Some("xml"));
        let resp = HttpResponse::new(
            200,
            r#"<r><pages>3</pages><items><item id="1"/><item id="2"/></items></r>"#,
        );
        let out = ResponseExtractor::new(&s, &p).extract(request(), &resp).unwrap();
        assert_eq!(out.content_type, Some(ContentType::Xml));
        assert_eq!(out.extra_data["total_pages"], json!("3"));
        assert_eq!(out.request_data.len(), 2);
    }

    #[test]
    fn list_item_projection_with_decoration_and_cast() {
        let mut tags = ResponseKey::field("tags", "tags");
        tags.list_item = true;
        tags.array_keys = Some("label".to_string());
        tags.prepend_extra_data = true;
        tags.prepend_extra_data_value = Some("#".to_string());

        let mut price = ResponseKey::field("price", "price");
        price.return_data_type = Some(ReturnDataType::Float);

        let mut category = ResponseKey::field("category_id", "category.id");
        category.is_service_request = true;

        let mut secret = ResponseKey::field("internal", "internal");
        secret.show_in_response = false;

        let s = sr(SrType::Single, vec![tags, price, category, secret]);
        let p = provider(None);
        let resp = HttpResponse::json(
            200,
            &json!({
                "tags": [{"label": "a"}, {"label": "b"}, {"other": 1}],
                "price": "9.5",
                "category": {"id": 42},
                "internal": "x"
            }),
        );
        let item = ResponseExtractor::new(&s, &p)
            .extract(request(), &resp)
            .unwrap()
            .request_data
            .into_items()
            .remove(0);

        assert_eq!(item.fields["tags"], json!(["#a", "#b"]));
        assert_eq!(item.fields["price"], json!(9.5));
        assert_eq!(item.triggers["category_id"], json!(42));
        assert!(item.fields.get("category_id").is_none());
        assert_eq!(item.get("internal"), Some(&json!("x")));
        assert!(item.fields.get("internal").is_none());
    }

    #[test]
    fn path_lookup_supports_indexes_and_pointers() {
        let v = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(lookup_path(&v, "a.b.1.c"), Some(&json!(2)));
        assert_eq!(lookup_path(&v, "/a/b/0/c"), Some(&json!(1)));
        assert_eq!(lookup_path(&v, "$.a.b.0.c"), Some(&json!(1)));
        assert_eq!(lookup_path(&v, "a.x"), None);
        assert_eq!(lookup_path(&v, ""), Some(&v));
    }

    #[test]
    fn casts() {
        assert_eq!(cast(json!("42"), ReturnDataType::Integer), json!(42));
        assert_eq!(cast(json!(4.7), ReturnDataType::Integer), json!(4));
        assert_eq!(cast(json!(5), ReturnDataType::Text), json!("5"));
        assert_eq!(cast(json!("yes"), ReturnDataType::Boolean), json!(true));
        assert_eq!(cast(json!("x"), ReturnDataType::Array), json!(["x"]));
        assert_eq!(cast(json!(r#"{"a":1}"#), ReturnDataType::Object), json!({"a": 1}));
        assert_eq!(cast(json!("abc"), ReturnDataType::Integer), json!("abc"));
    }
}

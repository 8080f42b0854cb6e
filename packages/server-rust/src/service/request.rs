//! Request construction: effective Sr configuration plus resolved templates
//! into a transport-ready [`HttpRequest`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use opflow_core::model::{config_names, property_names};
use opflow_core::template::value_to_text;
use opflow_core::{
    AuthType, EffectiveServiceRequest, HttpMethod, Provider, QueryContext, ReservedValues,
    Resolution, TemplateResolver, WireFormat,
};
use tracing::debug;

use crate::service::operation::OperationError;
use crate::traits::OAuthTokenSource;
use crate::transport::HttpRequest;

const DEFAULT_CLIENT_ID_HEADER: &str = "Client-Id";

/// Builds one outbound request for an Sr invocation.
pub struct RequestBuilder<'a> {
    provider: &'a Provider,
    sr: &'a EffectiveServiceRequest,
    ctx: &'a QueryContext,
    reserved: ReservedValues,
}

impl<'a> RequestBuilder<'a> {
    /// `timestamp` binds the reserved `[timestamp]` placeholder (Unix seconds).
    #[must_use]
    pub fn new(
        provider: &'a Provider,
        sr: &'a EffectiveServiceRequest,
        ctx: &'a QueryContext,
        timestamp: u64,
    ) -> Self {
        Self {
            provider,
            sr,
            ctx,
            reserved: ReservedValues::new(provider, ctx, timestamp),
        }
    }

    fn resolver(&self) -> TemplateResolver<'_> {
        TemplateResolver::new(&self.reserved, self.ctx)
    }

    /// Assembles the request.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Config`] when the endpoint, method, auth
    /// secrets or wire format are missing, empty or unresolved, and
    /// [`OperationError::Transport`] when an OAuth token cannot be obtained.
    pub async fn build(&self, oauth: &dyn OAuthTokenSource) -> Result<HttpRequest, OperationError> {
        let endpoint = self.required(config_names::ENDPOINT)?;
        let method = self
            .required(config_names::REQUEST_METHOD)?
            .parse::<HttpMethod>()
            .map_err(|e| OperationError::Config(e.to_string()))?;

        let mut request = HttpRequest::new(method, self.join_url(&endpoint));
        request.headers = self.configured_headers();

        let auth = self
            .provider
            .auth_type()
            .map_err(|e| OperationError::Config(format!("provider {}: {e}", self.provider.id)))?;
        self.apply_auth(auth, oauth, &mut request).await?;
        self.apply_payload(&mut request)?;
        Ok(request)
    }

    /// Resolves a config item that must produce a non-empty value.
    fn required(&self, name: &str) -> Result<String, OperationError> {
        let raw = self.sr.config_value(name).ok_or_else(|| {
            OperationError::Config(format!("service request {} has no `{name}`", self.sr.id))
        })?;
        match self.resolver().resolve(raw) {
            Resolution::Resolved(value) => {
                let text = value_to_text(&value);
                if text.trim().is_empty() {
                    Err(OperationError::Config(format!(
                        "`{name}` of service request {} is empty",
                        self.sr.id
                    )))
                } else {
                    Ok(text)
                }
            }
            Resolution::Unresolved { placeholder } => Err(OperationError::Config(format!(
                "`{name}` of service request {} references unresolved [{placeholder}]",
                self.sr.id
            ))),
        }
    }

    /// Resolves an optional config item; unresolved counts as absent.
    fn optional(&self, name: &str) -> Option<String> {
        let raw = self.sr.config_value(name)?;
        self.resolver()
            .resolve(raw)
            .into_text()
            .filter(|s| !s.is_empty())
    }

    fn join_url(&self, endpoint: &str) -> String {
        let lower = endpoint.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.provider.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn configured_headers(&self) -> Vec<(String, String)> {
        let resolver = self.resolver();
        self.sr
            .config_pairs(config_names::HEADERS)
            .iter()
            .filter_map(|pair| match resolver.resolve(&pair.value) {
                Resolution::Resolved(v) => Some((pair.name.clone(), value_to_text(&v))),
                Resolution::Unresolved { placeholder } => {
                    debug!(header = %pair.name, %placeholder, "skipping unresolved header");
                    None
                }
            })
            .collect()
    }

    async fn apply_auth(
        &self,
        auth: AuthType,
        oauth: &dyn OAuthTokenSource,
        request: &mut HttpRequest,
    ) -> Result<(), OperationError> {
        match auth {
            AuthType::None | AuthType::AccessToken => {}
            AuthType::Basic => {
                let username = self.required(config_names::USERNAME)?;
                let password = self.optional(config_names::PASSWORD).unwrap_or_default();
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                set_authorization(request, format!("Basic {encoded}"));
            }
            AuthType::Bearer => {
                let token = self.required(config_names::BEARER_TOKEN)?;
                set_authorization(request, format!("Bearer {token}"));
            }
            AuthType::OAuth => {
                let token = oauth.access_token(self.provider).await.map_err(|source| {
                    OperationError::Transport {
                        url: self
                            .provider
                            .property(property_names::OAUTH_TOKEN_URL)
                            .unwrap_or_default()
                            .to_string(),
                        source,
                    }
                })?;
                set_authorization(request, format!("Bearer {token}"));
                if let Some(client_id) = self.provider.access_key.as_deref() {
                    let header = self
                        .provider
                        .property(property_names::CLIENT_ID_HEADER)
                        .unwrap_or(DEFAULT_CLIENT_ID_HEADER);
                    request
                        .headers
                        .push((header.to_string(), client_id.to_string()));
                }
            }
        }
        Ok(())
    }

    /// An unknown wire format is rejected even when there is nothing to
    /// send; a missing one only matters once parameters exist.
    fn apply_payload(&self, request: &mut HttpRequest) -> Result<(), OperationError> {
        let format = self
            .provider
            .wire_format()
            .map_err(|e| OperationError::Config(format!("provider {}: {e}", self.provider.id)))?;
        if self.sr.parameters.is_empty() {
            return Ok(());
        }
        let format = format.ok_or_else(|| {
                OperationError::Config(format!(
                    "provider {} has parameters to send but no `{}`",
                    self.provider.id,
                    property_names::REQUEST_FORMAT
                ))
            })?;

        let resolver = self.resolver();
        let resolved = self.sr.parameters.iter().filter_map(|param| {
            match resolver.resolve(&param.value) {
                Resolution::Resolved(v) => Some((param.name.as_str(), value_to_text(&v))),
                Resolution::Unresolved { placeholder } => {
                    debug!(parameter = %param.name, %placeholder, "omitting unresolved parameter");
                    None
                }
            }
        });

        match format {
            WireFormat::QueryString => {
                let mut query: Vec<(String, String)> = Vec::new();
                for (name, value) in resolved {
                    if let Some((_, existing)) = query.iter_mut().find(|(k, _)| k == name) {
                        existing.push(',');
                        existing.push_str(&value);
                    } else {
                        query.push((name.to_string(), value));
                    }
                }
                request.query = query;
            }
            WireFormat::QuerySchema => {
                let body = resolved
                    .map(|(_, v)| v)
                    .filter(|v| !v.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                request.body = Some(body);
            }
        }
        Ok(())
    }
}

fn set_authorization(request: &mut HttpRequest, value: String) {
    request
        .headers
        .retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
    request.headers.push(("Authorization".to_string(), value));
}

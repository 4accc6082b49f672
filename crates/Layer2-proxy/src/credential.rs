//! Credential binding for one proxy session

use axum::http::{header, HeaderName, HeaderValue};
use relay_foundation::{Error, Result, UpstreamCredential};
use secrecy::{ExposeSecret, SecretString};

/// Env var the child reads its base URL from
pub const ENV_BASE_URL: &str = "ANTHROPIC_BASE_URL";
/// Placeholder env var for the API-key scheme
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
/// Placeholder env var for the bearer scheme
pub const ENV_AUTH_TOKEN: &str = "ANTHROPIC_AUTH_TOKEN";

pub(crate) const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// The one scheme a session accepts, with its placeholder and real value
pub(crate) struct SessionAuth {
    scheme: Scheme,
    placeholder: String,
    real: SecretString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    ApiKey,
    Bearer,
}

/// Header to overwrite on the forwarded request
pub(crate) type Substitution = (HeaderName, HeaderValue);

impl SessionAuth {
    pub(crate) fn new(credential: UpstreamCredential) -> Self {
        let placeholder = format!("relay-placeholder-{}", uuid::Uuid::new_v4().simple());
        let (scheme, real) = match credential {
            UpstreamCredential::ApiKey(secret) => (Scheme::ApiKey, secret),
            UpstreamCredential::Bearer(secret) => (Scheme::Bearer, secret),
        };
        Self {
            scheme,
            placeholder,
            real,
        }
    }

    pub(crate) fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Env var naming the placeholder for the active scheme
    pub(crate) fn env_name(&self) -> &'static str {
        match self.scheme {
            Scheme::ApiKey => ENV_API_KEY,
            Scheme::Bearer => ENV_AUTH_TOKEN,
        }
    }

    pub(crate) fn scheme_name(&self) -> &'static str {
        match self.scheme {
            Scheme::ApiKey => "api_key",
            Scheme::Bearer => "bearer",
        }
    }

    /// Check the presented header value and produce the real replacement.
    ///
    /// `api_key` is the `x-api-key` value, `authorization` the raw
    /// `authorization` value. No fallback between schemes.
    pub(crate) fn substitute(
        &self,
        api_key: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<Substitution> {
        let (name, value) = match self.scheme {
            Scheme::ApiKey => {
                let presented = api_key.ok_or_else(|| missing("x-api-key"))?;
                if presented != self.placeholder {
                    return Err(mismatch("x-api-key"));
                }
                (X_API_KEY, self.real.expose_secret().to_string())
            }
            Scheme::Bearer => {
                let raw = authorization.ok_or_else(|| missing("authorization"))?;
                let (kind, token) = raw.split_once(' ').ok_or_else(|| mismatch("authorization"))?;
                if !kind.eq_ignore_ascii_case("bearer") || token.trim() != self.placeholder {
                    return Err(mismatch("authorization"));
                }
                (
                    header::AUTHORIZATION,
                    format!("Bearer {}", self.real.expose_secret()),
                )
            }
        };
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| Error::ProxyAuth("real credential is not a valid header value".into()))?;
        value.set_sensitive(true);
        Ok((name, value))
    }
}

fn missing(header: &str) -> Error {
    Error::ProxyAuth(format!("no {} header for this session", header))
}

fn mismatch(header: &str) -> Error {
    Error::ProxyAuth(format!("{} does not carry the session credential", header))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_substitution() {
        let auth = SessionAuth::new(UpstreamCredential::ApiKey("sk-real".into()));
        let placeholder = auth.placeholder().to_string();
        assert_ne!(placeholder, "sk-real");
        assert_eq!(auth.env_name(), ENV_API_KEY);

        let (name, value) = auth.substitute(Some(&placeholder), None).unwrap();
        assert_eq!(name, "x-api-key");
        assert_eq!(value, "sk-real");
        assert!(value.is_sensitive());
        assert!(matches!(
            auth.substitute(Some("sk-guess"), None),
            Err(Error::ProxyAuth(_))
        ));
        // right value, wrong scheme
        let err = auth
            .substitute(None, Some(&format!("Bearer {}", placeholder)))
            .unwrap_err();
        assert_eq!(err.kind(), "proxy_auth_error");
    }

    #[test]
    fn test_bearer_substitution() {
        let auth = SessionAuth::new(UpstreamCredential::Bearer("tok-real".into()));
        let presented = format!("bearer {}", auth.placeholder());
        let (name, value) = auth.substitute(None, Some(&presented)).unwrap();
        assert_eq!(name, header::AUTHORIZATION);
        assert_eq!(value, "Bearer tok-real");
        assert!(auth.substitute(Some(auth.placeholder()), None).is_err());
        assert!(auth.substitute(None, Some("Basic abc")).is_err());
    }
}

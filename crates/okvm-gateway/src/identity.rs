use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use okvm_session::{client_cookie, derive_client_key, ClientKey, CLIENT_HEADER};

/// The client key a request resolved to.
///
/// Taken from the `X-Client-Id` header, the `okvm_client` cookie or the
/// `client_id` query parameter, in that order. Requests carrying none get
/// a freshly generated key, which the response hands back as a cookie.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub key: ClientKey,
    pub generated: bool,
}

impl ClientIdentity {
    /// Attaches the key to `response`: always as `X-Client-Id`, and as a
    /// cookie when it was just generated.
    pub fn respond(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(self.key.as_str()) {
            headers.insert(CLIENT_HEADER, value);
        }
        if self.generated {
            if let Ok(value) = HeaderValue::from_str(&client_cookie(&self.key)) {
                headers.append(SET_COOKIE, value);
            }
        }
        response
    }

    /// [`respond`](Self::respond) for a handler outcome, so error bodies
    /// carry the key as well.
    pub fn reply<T, E>(&self, result: Result<T, E>) -> Response
    where
        T: IntoResponse,
        E: Into<ApiError>,
    {
        match result {
            Ok(response) => self.respond(response),
            Err(e) => self.respond(e.into()),
        }
    }
}

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(CLIENT_HEADER)
            .and_then(|v| v.to_str().ok());
        let cookies = parts.headers.get(COOKIE).and_then(|v| v.to_str().ok());
        let query = parts.uri.query();

        Ok(match derive_client_key(header, cookies, query)? {
            Some(key) => Self {
                key,
                generated: false,
            },
            None => {
                let key = ClientKey::generate();
                tracing::debug!(client_key = %key, "Generated client key");
                Self {
                    key,
                    generated: true,
                }
            }
        })
    }
}

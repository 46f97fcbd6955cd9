//! HTTPS JSON client for the issuing service.

use std::time::Duration;

use log::debug;
use reqwest::{
    StatusCode,
    blocking::{Client, Response},
};
use serde::{Serialize, de::DeserializeOwned};

use super::issuer::{
    CallbackStatus, CertData, IssuerApi, IssuerError, SigningRequest, SubmitResponse,
};

pub struct HttpIssuerClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Serialize)]
struct CallbackBody<'a> {
    domain: &'a str,
    status: CallbackStatus,
    message: &'a str,
}

impl HttpIssuerClient {
    /// Must be built outside an async context; the blocking client owns its own runtime.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, IssuerError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("certbinder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| IssuerError::Unavailable(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn read_json<T: DeserializeOwned>(
        response: Response,
        order_id: Option<u64>,
    ) -> Result<T, IssuerError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .map_err(|err| IssuerError::InvalidResponse(err.to_string()));
        }
        Err(Self::status_error(status, response.text().unwrap_or_default(), order_id))
    }

    fn status_error(status: StatusCode, body: String, order_id: Option<u64>) -> IssuerError {
        match (status, order_id) {
            (StatusCode::NOT_FOUND, Some(id)) => IssuerError::NotFound(id),
            (s, _) if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                IssuerError::Unavailable(format!("HTTP {s}: {body}"))
            }
            (s, _) => IssuerError::Rejected(format!("HTTP {s}: {body}")),
        }
    }
}

fn transport_error(err: reqwest::Error) -> IssuerError {
    IssuerError::Unavailable(err.to_string())
}

impl IssuerApi for HttpIssuerClient {
    fn get_certificate(&self, order_id: u64) -> Result<CertData, IssuerError> {
        debug!("[issuer] GET order {order_id}");
        let response = self
            .client
            .get(self.url(&format!("orders/{order_id}")))
            .bearer_auth(&self.token)
            .send()
            .map_err(transport_error)?;
        Self::read_json(response, Some(order_id))
    }

    fn submit_signing_request(
        &self,
        request: &SigningRequest,
    ) -> Result<SubmitResponse, IssuerError> {
        debug!(
            "[issuer] submitting signing request for {} (order {:?})",
            request.domain, request.order_id
        );
        let response = self
            .client
            .post(self.url("orders"))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .map_err(transport_error)?;
        Self::read_json(response, request.order_id)
    }

    fn notify(
        &self,
        order_id: u64,
        domain: &str,
        status: CallbackStatus,
        message: &str,
    ) -> Result<(), IssuerError> {
        let response = self
            .client
            .post(self.url(&format!("orders/{order_id}/callback")))
            .bearer_auth(&self.token)
            .json(&CallbackBody {
                domain,
                status,
                message,
            })
            .send()
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::status_error(
                status,
                response.text().unwrap_or_default(),
                Some(order_id),
            ))
        }
    }
}

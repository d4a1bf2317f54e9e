use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::watch;
use tracing::debug;

use super::{GatewayError, Link, Publisher};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs each body to a fixed endpoint. Any 2xx counts as delivered.
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
    // HTTP has no session, so the link is always up.
    link: watch::Sender<Link>,
}

impl HttpPublisher {
    pub fn new(
        endpoint: &str,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<HttpPublisher, GatewayError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let (link, _) = watch::channel(Link::Up);
        Ok(HttpPublisher {
            client,
            endpoint: endpoint.to_string(),
            username,
            password,
            link,
        })
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, body: Vec<u8>) -> Result<(), GatewayError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }
        let response = request.send().await?;
        let status = response.status();
        debug!(endpoint = %self.endpoint, %status, "gateway answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(GatewayError::Status(status.as_u16()))
        }
    }

    async fn close(&self) {}

    fn link(&self) -> watch::Receiver<Link> {
        self.link.subscribe()
    }
}

use crate::model::WhatsAppAccount;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/";
const GRAPH_API_VERSION: &str = "v18.0";

/// WhatsApp Cloud API client. Credentials travel with the account, not the
/// client, so one client serves every tenant.
#[derive(Clone)]
pub struct WhatsAppClient {
    http: Client,
    base_url: Url,
    api_version: String,
}

impl fmt::Debug for WhatsAppClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Outbound template send. Errors are opaque strings surfaced to the caller;
/// the engine treats every send error as permanent for the recipient.
#[async_trait]
pub trait WhatsAppService: Send + Sync {
    async fn send_template(
        &self,
        account: &WhatsAppAccount,
        to: &str,
        template_name: &str,
        language: &str,
        body_params: &[String],
    ) -> Result<String>;
}

impl WhatsAppClient {
    pub fn new() -> Self {
        let base_url = Url::parse(GRAPH_API_BASE).expect("valid default Graph API URL");
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("wadispatch/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_version: GRAPH_API_VERSION.to_string(),
        }
    }

    pub fn build_request(&self, account: &WhatsAppAccount, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!(
                "{}/{}/messages",
                self.api_version, account.phone_number_id
            ))
            .context("invalid Graph API base URL")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", account.access_token))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build WhatsApp request")
    }

    async fn execute_send(&self, account: &WhatsAppAccount, body: Value) -> Result<String> {
        let request = self.build_request(account, &body)?;
        debug!(url=%request.url(), payload=%body, "sending whatsapp request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach WhatsApp API")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from WhatsApp API: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("whatsapp error {}: {}", status, body));
        }

        let payload: SendMessageResponse = res.json().await.context("invalid WhatsApp response")?;
        payload
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| anyhow!("WhatsApp response contained no message id"))
    }
}

impl Default for WhatsAppClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WhatsAppService for WhatsAppClient {
    async fn send_template(
        &self,
        account: &WhatsAppAccount,
        to: &str,
        template_name: &str,
        language: &str,
        body_params: &[String],
    ) -> Result<String> {
        let body = build_template_payload(to, template_name, language, body_params);
        self.execute_send(account, body).await
    }
}

/// Graph API template-message payload. The body component is omitted
/// entirely when there are no parameters.
pub fn build_template_payload(
    to: &str,
    template_name: &str,
    language: &str,
    body_params: &[String],
) -> Value {
    let mut template = json!({
        "name": template_name,
        "language": { "code": language },
    });

    if !body_params.is_empty() {
        let parameters: Vec<Value> = body_params
            .iter()
            .map(|p| json!({ "type": "text", "text": p }))
            .collect();
        template["components"] = json!([
            {
                "type": "body",
                "parameters": parameters,
            }
        ]);
    }

    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "template",
        "template": template,
    })
}

#[derive(Deserialize)]
struct SendMessageResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

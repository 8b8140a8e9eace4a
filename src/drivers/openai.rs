//! Generic OpenAI-compatible client: `{base}/chat/completions` or
//! `{base}/completions` with a bearer token.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::sync::Arc;

use super::{
    insert_header, into_provider_response, join_url, openai_body, parse_openai_frame,
    parse_openai_response, ProviderClient, ProviderRequest, ProviderResponse,
};
use crate::credentials::CredentialResolver;
use crate::transport::HttpTransport;
use crate::types::{EndpointKey, ModelDescriptor, Provider};
use crate::Result;

#[derive(Debug)]
pub struct OpenAiClient {
    model: Arc<ModelDescriptor>,
    transport: HttpTransport,
    credentials: CredentialResolver,
}

impl OpenAiClient {
    pub fn new(
        model: Arc<ModelDescriptor>,
        transport: HttpTransport,
        credentials: CredentialResolver,
    ) -> Self {
        Self {
            model,
            transport,
            credentials,
        }
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(cred) = self.credentials.resolve(&self.model.credential).await? {
            insert_header(
                &mut headers,
                "authorization",
                &format!("Bearer {}", cred.secret()),
            )?;
        }
        Ok(headers)
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn endpoint_key(&self) -> EndpointKey {
        self.model.endpoint_key()
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let endpoint = request.endpoint();
        let url = join_url(&self.model, endpoint.path())?;
        let body = openai_body(request, true)?;
        let headers = self.headers().await?;

        let resp = self
            .transport
            .post_json(url, headers, &body, request.stream)
            .await?;
        into_provider_response(
            resp,
            request.stream,
            |v| parse_openai_response(Provider::OpenAi, endpoint, v),
            move |f| parse_openai_frame(Provider::OpenAi, endpoint, f),
        )
        .await
    }
}

//! Azure OpenAI client.
//!
//! - URL: `{base}/openai/deployments/{deployment}/{path}?api-version={version}`
//! - static keys go in the `api-key` header, Azure AD tokens in `Authorization: Bearer`
//! - the deployment selects the model, so `model` is not sent in the body

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::sync::Arc;

use super::{
    insert_header, into_provider_response, join_url, openai_body, parse_openai_frame,
    parse_openai_response, ProviderClient, ProviderRequest, ProviderResponse,
};
use crate::credentials::{Credential, CredentialResolver};
use crate::transport::HttpTransport;
use crate::types::{EndpointKey, EndpointKind, ModelDescriptor, Provider};
use crate::Result;

pub const DEFAULT_API_VERSION: &str = "2024-02-01";

#[derive(Debug)]
pub struct AzureOpenAiClient {
    model: Arc<ModelDescriptor>,
    transport: HttpTransport,
    credentials: CredentialResolver,
}

impl AzureOpenAiClient {
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

    pub fn url(&self, endpoint: EndpointKind) -> Result<url::Url> {
        let path = format!(
            "openai/deployments/{}/{}",
            self.model.deployment(),
            endpoint.path()
        );
        let mut url = join_url(&self.model, &path)?;
        url.query_pairs_mut().append_pair(
            "api-version",
            self.model.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION),
        );
        Ok(url)
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        match self.credentials.resolve(&self.model.credential).await? {
            Some(Credential::ApiKey(key)) => insert_header(&mut headers, "api-key", &key)?,
            Some(Credential::Bearer(token)) => {
                insert_header(&mut headers, "authorization", &format!("Bearer {}", token))?
            }
            None => {}
        }
        Ok(headers)
    }
}

#[async_trait]
impl ProviderClient for AzureOpenAiClient {
    fn provider(&self) -> Provider {
        Provider::AzureOpenAi
    }

    fn endpoint_key(&self) -> EndpointKey {
        self.model.endpoint_key()
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let endpoint = request.endpoint();
        let url = self.url(endpoint)?;
        let body = openai_body(request, false)?;
        let headers = self.headers().await?;

        let resp = self
            .transport
            .post_json(url, headers, &body, request.stream)
            .await?;
        into_provider_response(
            resp,
            request.stream,
            |v| parse_openai_response(Provider::AzureOpenAi, endpoint, v),
            move |f| parse_openai_frame(Provider::AzureOpenAi, endpoint, f),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AzureTokenSource;
    use crate::drivers::tests::descriptor;
    use crate::transport::TransportConfig;
    use crate::types::{CredentialRef, RequestInput};

    struct FixedToken;

    #[async_trait]
    impl AzureTokenSource for FixedToken {
        async fn token(&self) -> Result<String> {
            Ok("aad".into())
        }
    }

    fn client(model: ModelDescriptor, credentials: CredentialResolver) -> AzureOpenAiClient {
        AzureOpenAiClient::new(
            Arc::new(model),
            HttpTransport::new(&TransportConfig::default().with_env_proxy(false)).unwrap(),
            credentials,
        )
    }

    #[test]
    fn test_resource_scoped_url() {
        let mut model = descriptor(Provider::AzureOpenAi, "https://res.openai.azure.com/");
        model.deployment = Some("gpt4-prod".into());
        model.api_version = Some("2024-06-01".into());
        let c = client(model, CredentialResolver::new());
        assert_eq!(
            c.url(EndpointKind::Chat).unwrap().as_str(),
            "https://res.openai.azure.com/openai/deployments/gpt4-prod/chat/completions?api-version=2024-06-01"
        );
        assert!(c
            .url(EndpointKind::Completion)
            .unwrap()
            .as_str()
            .contains("/completions?api-version="));
    }

    #[tokio::test]
    async fn test_api_key_and_bearer_headers() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"choices":[{"index":0,"text":"x","finish_reason":"stop"}]}"#;
        let key_mock = server
            .mock("POST", "/openai/deployments/m/completions")
            .match_query(mockito::Matcher::UrlEncoded(
                "api-version".into(),
                DEFAULT_API_VERSION.into(),
            ))
            .match_header("api-key", "sk")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let request = ProviderRequest {
            model: "m".into(),
            input: RequestInput::Prompt("p".into()),
            params: Default::default(),
            stream: false,
            tools: None,
            tool_choice: None,
            functions: None,
            function_call: None,
            user: None,
        };
        client(
            descriptor(Provider::AzureOpenAi, &server.url()),
            CredentialResolver::new(),
        )
        .send(&request)
        .await
        .unwrap();
        key_mock.assert_async().await;

        let bearer_mock = server
            .mock("POST", "/openai/deployments/m/completions")
            .match_query(mockito::Matcher::Any)
            .match_header("authorization", "Bearer aad")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
        let mut model = descriptor(Provider::AzureOpenAi, &server.url());
        model.credential = CredentialRef::AzureAd;
        client(model, CredentialResolver::new().with_azure(Arc::new(FixedToken)))
            .send(&request)
            .await
            .unwrap();
        bearer_mock.assert_async().await;
    }
}

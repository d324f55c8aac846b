//! Anthropic models on AWS Bedrock.
//!
//! Requests reuse the Anthropic Messages body (no `model`, Bedrock's
//! `anthropic_version`). Calls go through the AWS SDK, which signs them and
//! decodes the binary event-stream; each payload chunk is an Anthropic stream
//! event handed to the Anthropic dialect.
//!
//! Channel key format: `access_key|secret_key|region`, or `access_key|secret_key`
//! with the region taken from the channel config.

use super::anthropic::{self, AnthropicDialect, Target};
use super::{Adaptor, AdaptorError, RelayMeta, Result, UpstreamBody, UpstreamResponse};
use crate::models::chat::{ChatCompletionRequest, ChatCompletionResponse, ChatUsage};
use crate::stream::{RecordStream, StreamDialect, StreamRecord};
use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::config::{Credentials, Region};
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use http::header::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

static MODEL_IDS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("claude-instant-1.2", "anthropic.claude-instant-v1"),
        ("claude-2.0", "anthropic.claude-v2"),
        ("claude-2.1", "anthropic.claude-v2:1"),
        ("claude-3-sonnet-20240229", "anthropic.claude-3-sonnet-20240229-v1:0"),
        ("claude-3-opus-20240229", "anthropic.claude-3-opus-20240229-v1:0"),
        ("claude-3-haiku-20240307", "anthropic.claude-3-haiku-20240307-v1:0"),
        ("claude-3-5-sonnet-20240620", "anthropic.claude-3-5-sonnet-20240620-v1:0"),
        ("claude-3-5-sonnet-20241022", "anthropic.claude-3-5-sonnet-20241022-v2:0"),
        ("claude-3-5-haiku-20241022", "anthropic.claude-3-5-haiku-20241022-v1:0"),
        ("claude-3-7-sonnet-20250219", "anthropic.claude-3-7-sonnet-20250219-v1:0"),
        ("claude-sonnet-4-20250514", "anthropic.claude-sonnet-4-20250514-v1:0"),
        ("claude-opus-4-20250514", "anthropic.claude-opus-4-20250514-v1:0"),
        ("claude-opus-4-1-20250805", "anthropic.claude-opus-4-1-20250805-v1:0"),
        ("claude-sonnet-4-5-20250929", "anthropic.claude-sonnet-4-5-20250929-v1:0"),
        ("claude-haiku-4-5-20251001", "anthropic.claude-haiku-4-5-20251001-v1:0"),
        ("claude-opus-4-5-20251101", "anthropic.claude-opus-4-5-20251101-v1:0"),
    ])
});

/// Bedrock model id → region geographies with a cross-region inference profile.
static CROSS_REGION: Lazy<HashMap<&'static str, HashSet<&'static str>>> = Lazy::new(|| {
    let all: HashSet<&str> = HashSet::from(["us", "eu", "ap"]);
    let us: HashSet<&str> = HashSet::from(["us"]);
    let us_ap: HashSet<&str> = HashSet::from(["us", "ap"]);
    HashMap::from([
        ("anthropic.claude-3-sonnet-20240229-v1:0", all.clone()),
        ("anthropic.claude-3-opus-20240229-v1:0", us.clone()),
        ("anthropic.claude-3-haiku-20240307-v1:0", all.clone()),
        ("anthropic.claude-3-5-sonnet-20240620-v1:0", all.clone()),
        ("anthropic.claude-3-5-sonnet-20241022-v2:0", us_ap),
        ("anthropic.claude-3-5-haiku-20241022-v1:0", us.clone()),
        ("anthropic.claude-3-7-sonnet-20250219-v1:0", all.clone()),
        ("anthropic.claude-sonnet-4-20250514-v1:0", all.clone()),
        ("anthropic.claude-opus-4-20250514-v1:0", us.clone()),
        ("anthropic.claude-opus-4-1-20250805-v1:0", us),
        ("anthropic.claude-sonnet-4-5-20250929-v1:0", all.clone()),
        ("anthropic.claude-opus-4-5-20251101-v1:0", all.clone()),
        ("anthropic.claude-haiku-4-5-20251001-v1:0", all),
    ])
});

/// Explicit Bedrock ids, optionally carrying an inference-profile prefix.
static EXPLICIT_MODEL_ID: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(?:(?:us|eu|apac|global)\.)?anthropic\.[A-Za-z0-9._:-]+$").ok()
});

fn profile_prefix(geo: &str) -> Option<&'static str> {
    match geo {
        "us" => Some("us"),
        "eu" => Some("eu"),
        "ap" => Some("apac"),
        _ => None,
    }
}

/// Map a request model to a Bedrock model id, adding the cross-region
/// profile prefix when the model supports it in the region's geography.
pub fn resolve_model_id(model: &str, region: &str) -> Result<String> {
    let base = anthropic::base_model_name(model);
    let id = match MODEL_IDS.get(base) {
        Some(id) => id.to_string(),
        None => {
            let explicit = EXPLICIT_MODEL_ID
                .as_ref()
                .map(|re| re.is_match(base))
                .unwrap_or_else(|| base.contains("anthropic."));
            if explicit {
                return Ok(base.to_string());
            }
            return Err(AdaptorError::UnsupportedModel(format!(
                "{} is not mapped and is not a Bedrock model id",
                model
            )));
        }
    };
    let geo = region.split('-').next().unwrap_or_default();
    let supported = CROSS_REGION
        .get(id.as_str())
        .map(|set| set.contains(geo))
        .unwrap_or(false);
    match profile_prefix(geo) {
        Some(prefix) if supported => Ok(format!("{}.{}", prefix, id)),
        _ => Ok(id),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

pub fn parse_credentials(key: &str, config_region: Option<&str>) -> Result<AwsCredentials> {
    let parts: Vec<&str> = key.split('|').map(|p| p.trim()).collect();
    let (ak, sk, region) = match parts.as_slice() {
        [ak, sk, region] => (*ak, *sk, *region),
        [ak, sk] => (*ak, *sk, config_region.unwrap_or_default()),
        _ => {
            return Err(AdaptorError::InvalidCredentials(
                "bedrock key must be access_key|secret_key|region".into(),
            ))
        }
    };
    if ak.is_empty() || sk.is_empty() || region.is_empty() {
        return Err(AdaptorError::InvalidCredentials(
            "bedrock access key, secret key and region must be non-empty".into(),
        ));
    }
    Ok(AwsCredentials {
        access_key: ak.to_string(),
        secret_key: sk.to_string(),
        region: region.to_string(),
    })
}

/// Turn an SDK failure into an upstream response when AWS answered, or a
/// transport error when it did not.
fn sdk_failure<E>(err: SdkError<E, HttpResponse>) -> Result<UpstreamResponse>
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let Some(raw) = err.raw_response() else {
        return Err(AdaptorError::Transport(DisplayErrorContext(&err).to_string()));
    };
    let status = raw.status().as_u16();
    let body = json!({
        "message": err.message().unwrap_or("bedrock request failed"),
        "__type": err.code().unwrap_or("upstream_error"),
    });
    tracing::debug!(status, error = %DisplayErrorContext(&err), "bedrock call failed");
    Ok(UpstreamResponse::full(status, "application/json", body.to_string()))
}

pub struct BedrockAdaptor {
    http: reqwest::Client,
}

impl BedrockAdaptor {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn credentials(meta: &RelayMeta) -> Result<AwsCredentials> {
        parse_credentials(&meta.api_key, meta.config.region.as_deref())
    }

    async fn client(creds: &AwsCredentials) -> aws_sdk_bedrockruntime::Client {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(creds.region.clone()))
            .credentials_provider(Credentials::new(
                creds.access_key.clone(),
                creds.secret_key.clone(),
                None,
                None,
                "relayium-channel",
            ))
            .load()
            .await;
        aws_sdk_bedrockruntime::Client::new(&sdk_config)
    }
}

#[async_trait::async_trait]
impl Adaptor for BedrockAdaptor {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn init(&self, meta: &RelayMeta) -> Result<()> {
        let creds = Self::credentials(meta)?;
        resolve_model_id(&meta.actual_model, &creds.region).map(|_| ())
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String> {
        let creds = Self::credentials(meta)?;
        let id = resolve_model_id(&meta.actual_model, &creds.region)?;
        let action = if meta.is_stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        Ok(format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/{}",
            creds.region, id, action
        ))
    }

    fn setup_headers(
        &self,
        _headers: &mut HeaderMap,
        _client: &HeaderMap,
        _meta: &RelayMeta,
    ) -> Result<()> {
        // signed by the SDK
        Ok(())
    }

    async fn convert_request(
        &self,
        req: &ChatCompletionRequest,
        meta: &RelayMeta,
    ) -> Result<Value> {
        let mut body =
            anthropic::build_request(&self.http, req, &meta.actual_model, Target::Bedrock).await?;
        body.anthropic_version = Some(BEDROCK_ANTHROPIC_VERSION.to_string());
        serde_json::to_value(body).map_err(|e| AdaptorError::Convert(e.to_string()))
    }

    async fn execute(
        &self,
        meta: &RelayMeta,
        body: Value,
        _client_headers: &HeaderMap,
    ) -> Result<UpstreamResponse> {
        let creds = Self::credentials(meta)?;
        let model_id = resolve_model_id(&meta.actual_model, &creds.region)?;
        let client = Self::client(&creds).await;
        let bytes = serde_json::to_vec(&body).map_err(|e| AdaptorError::Convert(e.to_string()))?;
        tracing::debug!(model_id = %model_id, region = %creds.region, stream = meta.is_stream, "invoking bedrock");

        if !meta.is_stream {
            return match client
                .invoke_model()
                .model_id(&model_id)
                .content_type("application/json")
                .accept("application/json")
                .body(Blob::new(bytes))
                .send()
                .await
            {
                Ok(out) => Ok(UpstreamResponse::full(
                    200,
                    "application/json",
                    out.body().as_ref().to_vec(),
                )),
                Err(e) => sdk_failure(e),
            };
        }

        let out = match client
            .invoke_model_with_response_stream()
            .model_id(&model_id)
            .content_type("application/json")
            .body(Blob::new(bytes))
            .send()
            .await
        {
            Ok(out) => out,
            Err(e) => return sdk_failure(e),
        };
        let mut events = out.body;
        let records: RecordStream = Box::pin(async_stream::stream! {
            loop {
                match events.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        if let Some(blob) = part.bytes() {
                            let data = String::from_utf8_lossy(blob.as_ref()).into_owned();
                            let event = serde_json::from_str::<Value>(&data)
                                .ok()
                                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from));
                            yield Ok(StreamRecord { event, data });
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(std::io::Error::other(DisplayErrorContext(&e).to_string()));
                        break;
                    }
                }
            }
        });
        Ok(UpstreamResponse {
            status: 200,
            content_type: Some("application/vnd.amazon.eventstream".into()),
            body: UpstreamBody::Records(records),
        })
    }

    fn convert_response(
        &self,
        meta: &RelayMeta,
        body: &[u8],
    ) -> Result<(ChatCompletionResponse, ChatUsage)> {
        anthropic::parse_response(body, &meta.actual_model)
    }

    fn stream_dialect(&self, _meta: &RelayMeta) -> Box<dyn StreamDialect> {
        Box::new(AnthropicDialect::default())
    }

    fn error_parser(&self) -> Option<super::error::EnvelopeParser> {
        Some(super::error::parse_aws)
    }

    fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = MODEL_IDS.keys().map(|m| m.to_string()).collect();
        models.sort();
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelType};

    #[test]
    fn credentials_accept_region_from_key_or_config() {
        let c = parse_credentials("AKIA|secret|us-west-2", None).unwrap();
        assert_eq!(c.region, "us-west-2");
        let c = parse_credentials("AKIA|secret", Some("eu-central-1")).unwrap();
        assert_eq!(c.region, "eu-central-1");
        assert!(parse_credentials("AKIA|secret", None).is_err());
        assert!(parse_credentials("just-a-key", Some("us-east-1")).is_err());
        assert!(parse_credentials("|secret|us-east-1", None).is_err());
    }

    #[test]
    fn model_ids_get_cross_region_prefix() {
        assert_eq!(
            resolve_model_id("claude-3-5-sonnet-20241022", "us-east-1").unwrap(),
            "us.anthropic.claude-3-5-sonnet-20241022-v2:0"
        );
        // no eu profile for this model
        assert_eq!(
            resolve_model_id("claude-3-5-sonnet-20241022", "eu-west-1").unwrap(),
            "anthropic.claude-3-5-sonnet-20241022-v2:0"
        );
        assert_eq!(
            resolve_model_id("claude-3-7-sonnet-20250219-thinking", "ap-northeast-1").unwrap(),
            "apac.anthropic.claude-3-7-sonnet-20250219-v1:0"
        );
        assert_eq!(
            resolve_model_id("claude-2.1", "us-east-1").unwrap(),
            "anthropic.claude-v2:1"
        );
    }

    #[test]
    fn explicit_ids_pass_and_unknown_models_fail() {
        assert_eq!(
            resolve_model_id("eu.anthropic.claude-3-haiku-20240307-v1:0", "eu-west-1").unwrap(),
            "eu.anthropic.claude-3-haiku-20240307-v1:0"
        );
        assert!(matches!(
            resolve_model_id("gpt-4o", "us-east-1"),
            Err(AdaptorError::UnsupportedModel(_))
        ));
    }

    fn meta(model: &str) -> RelayMeta {
        let ch = Channel::new(9, "aws", ChannelType::Bedrock, "AKIA|secret|us-east-1");
        RelayMeta::for_channel(&ch, "AKIA|secret|us-east-1", 0, model)
    }

    #[test]
    fn url_names_region_and_action() {
        let a = BedrockAdaptor::new(reqwest::Client::new());
        let mut m = meta("claude-3-haiku-20240307");
        m.is_stream = true;
        assert_eq!(
            a.request_url(&m).unwrap(),
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/us.anthropic.claude-3-haiku-20240307-v1:0/invoke-with-response-stream"
        );
        assert!(a.init(&meta("mistral-large")).is_err());
    }

    #[tokio::test]
    async fn body_carries_bedrock_version_without_model() {
        let a = BedrockAdaptor::new(reqwest::Client::new());
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "system", "content": "s"}, {"role": "user", "content": "u"}],
            "stream": true
        }))
        .unwrap();
        let body = a.convert_request(&req, &meta("claude-3-haiku-20240307")).await.unwrap();
        assert_eq!(body["anthropic_version"], BEDROCK_ANTHROPIC_VERSION);
        assert_eq!(body["system"], "s");
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn aws_errors_parse_with_native_parser() {
        let a = BedrockAdaptor::new(reqwest::Client::new());
        let body = json!({"message": "Too many tokens", "__type": "ThrottlingException"});
        let err = super::super::error::relay_error_from_body(429, body.to_string().as_bytes(), a.error_parser());
        assert_eq!(err.error_type(), "ThrottlingException");
        assert_eq!(err.message(), "Too many tokens");
    }
}

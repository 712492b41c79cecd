use async_trait::async_trait;
use futures::StreamExt;
use log::{ debug, info };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ BackendError, CompletionBackend, DeltaStream };
use crate::models::wire::{ ChatRequest, ChatTurn };

const OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";

/// Client for the OpenAI Responses API (`POST {base}/responses`).
pub struct OpenAIResponsesClient {
    http: HttpClient,
    model: String,
    url: String,
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: &'a [ChatTurn],
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ResponsesStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<String>,
}

impl ResponsesResponse {
    fn output_text(&self) -> String {
        self.output
            .iter()
            .flat_map(|item| item.content.iter())
            .filter(|c| c.content_type == "output_text")
            .map(|c| c.text.as_str())
            .collect()
    }
}

/// Pulls text deltas out of one chunk of server-sent events.
fn parse_sse_chunk(text: &str) -> Vec<String> {
    let mut deltas = Vec::new();
    for line in text.lines() {
        let data = match line.strip_prefix("data:") {
            Some(data) => data.trim_start(),
            None => continue,
        };
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        match serde_json::from_str::<ResponsesStreamEvent>(data) {
            Ok(event) if event.event_type == OUTPUT_TEXT_DELTA => {
                if let Some(delta) = event.delta.filter(|d| !d.is_empty()) {
                    deltas.push(delta);
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!("JSON parse error: {} for data: {}", e, data);
            }
        }
    }
    deltas
}

impl OpenAIResponsesClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        max_output_tokens: u32
    ) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| BackendError::InvalidKey(e.to_string()))?
        );
        let http = HttpClient::builder().default_headers(headers).build()?;
        let url = format!("{}/responses", base_url.trim_end_matches('/'));

        Ok(Self {
            http,
            model: model.to_string(),
            url,
            max_output_tokens,
        })
    }

    fn body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> ResponsesRequest<'a> {
        ResponsesRequest {
            model: &self.model,
            instructions: &request.instructions,
            input: &request.input,
            max_output_tokens: self.max_output_tokens,
            stream: if stream { Some(true) } else { None },
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, BackendError> {
        let resp = self.http.post(&self.url).json(&self.body(request, stream)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl CompletionBackend for OpenAIResponsesClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, BackendError> {
        let resp: ResponsesResponse = self.send(request, false).await?.json().await?;
        let text = resp.output_text();
        if text.is_empty() {
            return Err(BackendError::MissingOutput);
        }
        Ok(text)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream, BackendError> {
        let resp = self.send(request, true).await?;
        info!("Streaming {} turns from {}", request.input.len(), self.model);

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut pending = String::new();

            while let Some(chunk_result) = stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        pending.push_str(&String::from_utf8_lossy(&chunk));
                        // Hold back an incomplete trailing event line until the next chunk.
                        let complete = match pending.rfind('\n') {
                            Some(idx) => pending.drain(..=idx).collect::<String>(),
                            None => continue,
                        };
                        for delta in parse_sse_chunk(&complete) {
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }

            for delta in parse_sse_chunk(&pending) {
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Role;
    use wiremock::matchers::{ body_partial_json, header, method, path };
    use wiremock::{ Mock, MockServer, ResponseTemplate };

    fn request() -> ChatRequest {
        ChatRequest {
            instructions: "Be brief.".into(),
            input: vec![ChatTurn { role: Role::User, content: "Hi".into() }],
        }
    }

    #[test]
    fn sse_parsing_keeps_only_text_deltas() {
        let chunk = concat!(
            "event: response.created\n",
            "data: {\"type\":\"response.created\"}\n\n",
            "event: response.output_text.delta\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hel\"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"\"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"lo\"}\n\n",
            "data: {broken\n\n",
            "data: [DONE]\n"
        );
        assert_eq!(parse_sse_chunk(chunk), vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn complete_joins_output_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "m",
                "instructions": "Be brief.",
                "max_output_tokens": 300,
                "input": [{ "role": "user", "content": "Hi" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": [
                    { "type": "reasoning", "content": [] },
                    { "type": "message", "content": [
                        { "type": "output_text", "text": "Hello" },
                        { "type": "output_text", "text": " there" }
                    ]}
                ]
            })))
            .mount(&server).await;

        let client = OpenAIResponsesClient::new("sk-test", &format!("{}/v1", server.uri()), "m", 300).unwrap();
        assert_eq!(client.complete(&request()).await.unwrap(), "Hello there");
    }

    #[tokio::test]
    async fn stream_yields_deltas_and_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(body_partial_json(serde_json::json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(
                    "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hel\"}\n\ndata: {\"type\":\"response.output_text.delta\",\"delta\":\"lo\"}"
                )
            )
            .mount(&server).await;

        let client = OpenAIResponsesClient::new("sk-test", &format!("{}/v1", server.uri()), "m", 300).unwrap();
        let deltas: Vec<String> = client
            .stream(&request()).await
            .unwrap()
            .map(|d| d.unwrap())
            .collect().await;
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);

        let failing = OpenAIResponsesClient::new("sk-test", &format!("{}/nope", server.uri()), "m", 300).unwrap();
        match failing.stream(&request()).await {
            Err(BackendError::Status { status, .. }) => assert_eq!(status, 404),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected a status error"),
        }
    }
}

//! Minimal HTTP/1.1 handling for the API server: request parsing, routing,
//! and response rendering. The accept loop lives in `bin/server.rs`.

use crate::error::{ErrorKind, PipelineError, ResponseError};
use crate::pipeline::Pipeline;
use crate::prompts::Turn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

pub const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, ErrorKind::Internal, &format!("failed to serialize response: {}", e)),
        }
    }

    pub fn error(status: u16, kind: ErrorKind, message: &str) -> Self {
        let body = serde_json::json!({
            "error": { "kind": kind, "stage": "request", "message": message }
        });
        Self {
            status,
            body: body.to_string(),
        }
    }

    fn from_pipeline_error(err: &PipelineError) -> Self {
        let error = ResponseError::from(err);
        let status = status_for(error.kind);
        Self::json(status, &serde_json::json!({ "error": error }))
    }

    /// Serialize status line, headers and body.
    pub fn render(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            self.status,
            reason_phrase(self.status),
            self.body.len(),
            self.body
        )
    }
}

#[derive(Debug, PartialEq)]
pub enum ReadError {
    /// Peer closed before sending a full request head.
    Closed,
    Malformed(String),
    TooLarge,
    Io(String),
}

/// Read one request: head up to the blank line, then `Content-Length` bytes of body.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<HttpRequest, ReadError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ReadError::TooLarge);
        }
        let n = reader.read(&mut chunk).await.map_err(|e| ReadError::Io(e.to_string()))?;
        if n == 0 {
            return Err(ReadError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(ReadError::Malformed(format!("bad request line: {}", request_line)));
    }
    let method = parts[0].to_uppercase();

    // drop query string and trailing slash
    let mut path = parts[1].split('?').next().unwrap_or("/").trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ReadError::Malformed(format!("bad Content-Length: {}", v)))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(ReadError::TooLarge);
    }

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = reader.read(&mut chunk).await.map_err(|e| ReadError::Io(e.to_string()))?;
        if n == 0 {
            return Err(ReadError::Malformed("body shorter than Content-Length".to_string()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Deserialize)]
struct AskBody {
    #[serde(alias = "q", alias = "query")]
    question: String,
    #[serde(default)]
    history: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    #[serde(alias = "q", alias = "sql", alias = "question")]
    input: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    sql: String,
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(alias = "q", alias = "query")]
    question: String,
}

pub async fn route(pipeline: &Pipeline, request: &HttpRequest) -> HttpResponse {
    debug!("{} {}", request.method, request.path);
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => HttpResponse {
            status: 204,
            body: String::new(),
        },
        ("GET", "/health") => HttpResponse::json(200, &pipeline.health()),
        ("GET", "/schema") => HttpResponse::json(
            200,
            &serde_json::json!({
                "tables": pipeline.schema().tables(),
                "prompt": pipeline.schema().prompt_text(),
            }),
        ),
        ("POST", "/ask") => match parse_body::<AskBody>(request) {
            Ok(body) => HttpResponse::json(200, &pipeline.ask(&body.question, body.history).await),
            Err(resp) => resp,
        },
        ("POST", "/review") => match parse_body::<ReviewBody>(request) {
            Ok(body) => match pipeline.review(&body.input).await {
                Ok(report) => HttpResponse::json(200, &report),
                Err(e) => HttpResponse::from_pipeline_error(&e),
            },
            Err(resp) => resp,
        },
        ("POST", "/execute") => match parse_body::<ExecuteBody>(request) {
            Ok(body) => match pipeline.execute(&body.sql).await {
                Ok(result) => HttpResponse::json(200, &result),
                Err(e) => HttpResponse::from_pipeline_error(&e),
            },
            Err(resp) => resp,
        },
        ("POST", "/nl2sql") => match parse_body::<GenerateBody>(request) {
            Ok(body) => match pipeline.generate_sql(&body.question).await {
                Ok(candidate) => HttpResponse::json(200, &serde_json::json!({ "sql": candidate.executable_text() })),
                Err(e) => HttpResponse::from_pipeline_error(&e),
            },
            Err(resp) => resp,
        },
        (_, "/health" | "/schema" | "/ask" | "/review" | "/execute" | "/nl2sql") => HttpResponse::error(
            405,
            ErrorKind::Malformed,
            &format!("{} not allowed on {}", request.method, request.path),
        ),
        (method, path) => HttpResponse::error(
            404,
            ErrorKind::Malformed,
            &format!("Endpoint not found: {} {}", method, path),
        ),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(request: &HttpRequest) -> Result<T, HttpResponse> {
    let body: T = serde_json::from_slice(&request.body).map_err(|e| {
        HttpResponse::error(400, ErrorKind::Malformed, &format!("invalid JSON body: {}", e))
    })?;
    Ok(body)
}

fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Unavailable => 503,
        ErrorKind::Rejected => 502,
        ErrorKind::Timeout => 504,
        ErrorKind::Internal => 500,
        _ => 422,
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_head_and_body() {
        let raw = b"POST /ask/?x=1 HTTP/1.1\r\nHost: x\r\nContent-Length: 17\r\n\r\n{\"question\":\"hi\"}extra";
        let mut reader = &raw[..];
        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/ask");
        assert_eq!(req.headers.get("host").map(String::as_str), Some("x"));
        assert_eq!(req.body, b"{\"question\":\"hi\"}".to_vec());
    }

    #[tokio::test]
    async fn rejects_oversized_and_truncated_bodies() {
        let raw = format!("POST /ask HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_BODY_BYTES + 1);
        let mut reader = raw.as_bytes();
        assert_eq!(read_request(&mut reader).await.unwrap_err(), ReadError::TooLarge);

        let raw = b"POST /ask HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}";
        let mut reader = &raw[..];
        assert!(matches!(read_request(&mut reader).await, Err(ReadError::Malformed(_))));

        let mut empty: &[u8] = b"";
        assert_eq!(read_request(&mut empty).await.unwrap_err(), ReadError::Closed);
    }

    #[test]
    fn render_sets_length_and_reason() {
        let text = HttpResponse::json(200, &serde_json::json!({"ok": true})).render();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
    }
}

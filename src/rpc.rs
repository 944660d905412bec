use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Error taxonomy for the child RPC channel.
///
/// `NotFound`-style negatives are NOT errors; the facade models them as
/// values. Everything here is a genuine failure of the request.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The request deadline passed without a response.
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    /// The child exited or its stdio closed while the request was pending.
    #[error("pike process unavailable: {0}")]
    Transport(String),
    /// The response arrived but its shape is unusable (unknown id, bad envelope).
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A line on the child's stdout was not valid JSON.
    #[error("unparseable message from pike: {0}")]
    Parse(String),
    /// A well-formed error response from the child.
    #[error("pike error {code}: {message}")]
    Remote { code: i64, message: String },
}

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Request envelope written to the child's stdin.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Error member of a response envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// Response envelope read from the child's stdout. Exactly one of `result`
/// or `error` is expected; both absent or both present is a protocol
/// violation handled by the multiplexer.
#[derive(Debug, Deserialize)]
pub struct Response {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_present_result")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

/// Deserializes the `result` field as present-with-a-value (including
/// JSON `null`) rather than letting `Option<Value>`'s usual null-means-absent
/// rule collapse an explicit `"result": null` into a missing field.
fn deserialize_present_result<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Child-reported timing metadata, carried in `result._perf` and stripped
/// off before the result reaches callers.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PerfInfo {
    #[serde(default)]
    pub pike_total_ms: Option<f64>,
    /// Any further per-phase timings the child chooses to report.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One decoded unit from the child's stdout.
#[derive(Debug)]
pub enum ReadEvent {
    /// A line that decoded as JSON (response shape is checked downstream).
    Message(Response),
    /// A line that was not JSON. Surfaced, never silently dropped.
    ParseError { line: String, error: String },
    /// The stream ended (child exited or closed stdout).
    Eof,
}

/// Write one newline-terminated JSON frame. One call produces one complete
/// framed message or fails.
pub async fn write_frame<W>(writer: &mut W, request: &Request<'_>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(request).map_err(std::io::Error::other)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read the next frame from the child's stdout.
///
/// Splits on newline and decodes each line as JSON. Blank lines are skipped;
/// anything else that fails to decode comes back as `ParseError`.
pub async fn read_frame<R>(reader: &mut BufReader<R>) -> std::io::Result<ReadEvent>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(ReadEvent::Eof);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(match serde_json::from_str::<Response>(trimmed) {
            Ok(response) => ReadEvent::Message(response),
            Err(e) => ReadEvent::ParseError {
                line: trimmed.to_string(),
                error: e.to_string(),
            },
        });
    }
}

/// Pull `_perf` out of a result value, if present.
///
/// Returns the perf record and leaves the rest of the result untouched. The
/// field is removed so caches and handlers never see timing metadata as part
/// of the payload.
pub fn extract_perf(result: &mut Value) -> Option<PerfInfo> {
    let obj = result.as_object_mut()?;
    let raw = obj.remove("_perf")?;
    serde_json::from_value(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_frame_is_newline_terminated_json() {
        let mut buf: Vec<u8> = Vec::new();
        let req = Request::new(7, "analyze", serde_json::json!({"code": "int x;"}));
        write_frame(&mut buf, &req).await.unwrap();

        assert_eq!(buf.last(), Some(&b'\n'));
        let value: Value = serde_json::from_slice(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "analyze");
        assert_eq!(value["params"]["code"], "int x;");
    }

    #[tokio::test]
    async fn read_frame_decodes_responses_and_surfaces_junk() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\nnot json\n\n{\"id\":2,\"error\":{\"code\":-32601,\"message\":\"nope\"}}\n";
        let mut reader = BufReader::new(&input[..]);

        match read_frame(&mut reader).await.unwrap() {
            ReadEvent::Message(r) => assert_eq!(r.id, Some(1)),
            other => panic!("expected message, got {other:?}"),
        }
        match read_frame(&mut reader).await.unwrap() {
            ReadEvent::ParseError { line, .. } => assert_eq!(line, "not json"),
            other => panic!("expected parse error, got {other:?}"),
        }
        // Blank line is skipped, error response decodes.
        match read_frame(&mut reader).await.unwrap() {
            ReadEvent::Message(r) => {
                let err = r.error.unwrap();
                assert_eq!(err.code, METHOD_NOT_FOUND);
                assert_eq!(err.message, "nope");
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert!(matches!(read_frame(&mut reader).await.unwrap(), ReadEvent::Eof));
    }

    #[test]
    fn extract_perf_strips_the_field() {
        let mut result = serde_json::json!({
            "symbols": [],
            "_perf": {"pike_total_ms": 12.5, "compile_ms": 3.0}
        });
        let perf = extract_perf(&mut result).unwrap();
        assert_eq!(perf.pike_total_ms, Some(12.5));
        assert_eq!(perf.extra["compile_ms"], 3.0);
        assert!(result.get("_perf").is_none());
        assert!(result.get("symbols").is_some());
    }

    #[test]
    fn extract_perf_absent_is_none() {
        let mut result = serde_json::json!({"symbols": []});
        assert!(extract_perf(&mut result).is_none());
        assert_eq!(result, serde_json::json!({"symbols": []}));
    }
}

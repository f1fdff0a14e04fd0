//! Line-delimited JSON-RPC 2.0 surface over the module graph adapter.
//!
//! A host bundler running wasmbed as a child process sends one request per
//! line and receives one response per line. Methods map one-to-one onto
//! adapter operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::adapter::{ModuleGraphAdapter, ENTRY_ID_PREFIX};
use crate::error::WasmbedError;

pub const JSONRPC_VERSION: &str = "2.0";

pub mod methods {
    pub const RESOLVE: &str = "resolve";
    pub const LOAD: &str = "load";
    pub const CHANGE: &str = "change";
    pub const DIAGNOSTICS: &str = "diagnostics";
    pub const BUILD_ALL: &str = "build_all";
    pub const STATS: &str = "stats";

    /// Server -> host, when a watched change invalidated modules.
    pub const NOTIFY_INVALIDATED: &str = "$/invalidated";
}

pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Compilation failed or timed out; details are in `diagnostics`.
    pub const BUILD_FAILED: i32 = -32000;
    pub const UNKNOWN_MODULE: i32 = -32001;
    pub const EMBED_FAILED: i32 = -32002;
    pub const FINGERPRINT_FAILED: i32 = -32003;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// `null` only when the request id could not be read.
    pub id: Option<RequestId>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id: Some(id),
        }
    }

    /// Answer to a line that did not parse as a request.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcError::new(error_codes::PARSE_ERROR, message)),
            id: None,
        }
    }
}

/// Message with no id and no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn invalidated(ids: &[String]) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: methods::NOTIFY_INVALIDATED.to_string(),
            params: Some(json!({ "ids": ids })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }
}

impl From<&WasmbedError> for RpcError {
    fn from(err: &WasmbedError) -> Self {
        let code = match err {
            WasmbedError::Build(_) => error_codes::BUILD_FAILED,
            WasmbedError::UnknownEntry(_) | WasmbedError::UnknownModule(_) => {
                error_codes::UNKNOWN_MODULE
            }
            WasmbedError::Embed(_) => error_codes::EMBED_FAILED,
            WasmbedError::Fingerprint(_) => error_codes::FINGERPRINT_FAILED,
            _ => error_codes::INTERNAL_ERROR,
        };
        RpcError::new(code, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ResolveParams {
    specifier: String,
    #[serde(default)]
    importer: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct LoadParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChangeParams {
    path: PathBuf,
}

fn params<T: for<'de> Deserialize<'de>>(value: Option<Value>) -> Result<T, RpcError> {
    let value = value.ok_or_else(|| RpcError::invalid_params("missing params"))?;
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}

/// Handle one raw request line. Always produces a response.
pub async fn handle_line(adapter: &ModuleGraphAdapter, line: &str) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle_request(adapter, request).await,
        Err(e) => Response::parse_error(e.to_string()),
    }
}

pub async fn handle_request(adapter: &ModuleGraphAdapter, request: Request) -> Response {
    let id = request.id.clone();
    match dispatch(adapter, request).await {
        Ok(value) => Response::success(id, value),
        Err(error) => Response::error(id, error),
    }
}

async fn dispatch(adapter: &ModuleGraphAdapter, request: Request) -> Result<Value, RpcError> {
    match request.method.as_str() {
        methods::RESOLVE => {
            let p: ResolveParams = params(request.params)?;
            let id = adapter
                .resolve(&p.specifier, p.importer.as_deref())
                .map_err(|e| RpcError::from(&e))?;
            Ok(json!({ "id": id }))
        }
        methods::LOAD => {
            let p: LoadParams = params(request.params)?;
            match adapter.load(&p.id).await {
                Ok(record) => to_value(&record),
                Err(err) => {
                    let diagnostics = match p.id.strip_prefix(ENTRY_ID_PREFIX) {
                        Some(entry) => adapter.diagnostics().drain_entry(entry),
                        None => Vec::new(),
                    };
                    let mut rpc = RpcError::from(&err);
                    rpc.data = Some(to_value(&diagnostics)?);
                    Err(rpc)
                }
            }
        }
        methods::CHANGE => {
            let p: ChangeParams = params(request.params)?;
            Ok(json!({ "invalidated": adapter.handle_change(&p.path) }))
        }
        methods::DIAGNOSTICS => to_value(&adapter.diagnostics().drain()),
        methods::BUILD_ALL => {
            let results = adapter.build_all().await;
            let entries: Vec<Value> = results
                .into_iter()
                .map(|(name, result)| match result {
                    Ok(node) => json!({
                        "entry": name,
                        "ok": true,
                        "fingerprint": node.fingerprint().to_hex(),
                        "generation": node.generation,
                    }),
                    Err(err) => json!({ "entry": name, "ok": false, "error": err.to_string() }),
                })
                .collect();
            Ok(json!({
                "entries": entries,
                "diagnostics": to_value(&adapter.diagnostics().drain())?,
            }))
        }
        methods::STATS => to_value(&adapter.cache().stats()),
        other => Err(RpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(error_codes::INTERNAL_ERROR, e.to_string()))
}

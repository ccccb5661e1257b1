//! MCP server: JSON-RPC request dispatch over a `CoreRuntime`.

use std::sync::Arc;

use memoria_core::CoreRuntime;
use serde_json::json;

use crate::protocol::messages::{
    CallToolRequest, CallToolResult, InitializeRequest, InitializeResult, ListToolsResult,
    ServerCapabilities, ServerInfo, LATEST_PROTOCOL_VERSION,
};
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::tools;

pub struct McpServer {
    runtime: Arc<CoreRuntime>,
    initialized: bool,
}

impl McpServer {
    pub fn new(runtime: Arc<CoreRuntime>) -> Self {
        McpServer { runtime, initialized: false }
    }

    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params),
            "notifications/initialized" => {
                self.initialized = true;
                return None;
            }
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(request.params).await,
            "ping" => Ok(json!({})),
            other => Err(JsonRpcError::method_not_found_with_message(&format!("unknown method '{other}'"))),
        };

        if is_notification {
            return None;
        }

        Some(match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(err) => JsonRpcResponse::error(request.id, err),
        })
    }

    fn handle_initialize(&mut self, params: Option<serde_json::Value>) -> Result<serde_json::Value, JsonRpcError> {
        let _req: InitializeRequest = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e: serde_json::Error| JsonRpcError::invalid_params(&e.to_string()))?
            .unwrap_or_default();

        let result = InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            server_info: ServerInfo { name: "memoria-mcp".to_string(), version: memoria_core::VERSION.to_string() },
            capabilities: ServerCapabilities::default(),
            instructions: "A hybrid vector + lexical memory catalog exposed over MCP. Use memory_search to retrieve \
                           relevant memories, memory_save/memory_update/memory_delete to maintain them, and the \
                           checkpoint_* tools to snapshot and restore the catalog."
                .to_string(),
        };

        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn handle_tools_list(&self) -> Result<serde_json::Value, JsonRpcError> {
        if !self.initialized {
            return Err(JsonRpcError::server_not_initialized());
        }
        let result = ListToolsResult { tools: tools::descriptions() };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    async fn handle_tools_call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value, JsonRpcError> {
        if !self.initialized {
            return Err(JsonRpcError::server_not_initialized());
        }
        let params = params.ok_or_else(|| JsonRpcError::invalid_params("missing params"))?;
        let request: CallToolRequest =
            serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?;

        let (envelope, is_error) = tools::dispatch(&self.runtime, &request.name, &request.arguments).await;
        let result = CallToolResult::from_envelope(envelope, is_error);
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::Config;

    async fn test_server() -> McpServer {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("test.sqlite"));
        config.embedding_dim_fallback = 4;
        let runtime = CoreRuntime::open(config).unwrap();
        McpServer::new(Arc::new(runtime))
    }

    fn make_request(method: &str, params: Option<serde_json::Value>, id: Option<i64>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: id.map(|i| json!(i)),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn initialize_returns_server_info() {
        let mut server = test_server().await;
        let response = server.handle_request(make_request("initialize", None, Some(1))).await.unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["serverInfo"]["name"], "memoria-mcp");
    }

    #[tokio::test]
    async fn tools_list_rejects_before_initialize() {
        let mut server = test_server().await;
        let response = server.handle_request(make_request("tools/list", None, Some(2))).await.unwrap();
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn tools_list_after_initialize_lists_memory_search() {
        let mut server = test_server().await;
        server.handle_request(make_request("initialize", None, Some(1))).await;
        server.handle_request(make_request("notifications/initialized", None, None)).await;
        let response = server.handle_request(make_request("tools/list", None, Some(2))).await.unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        assert!(tools.iter().any(|t| t["name"] == "memory_search"));
    }

    #[tokio::test]
    async fn notification_produces_no_response() {
        let mut server = test_server().await;
        let response = server.handle_request(make_request("notifications/initialized", None, None)).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let mut server = test_server().await;
        let response = server.handle_request(make_request("bogus/method", None, Some(1))).await.unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn ping_succeeds_without_initialize() {
        let mut server = test_server().await;
        let response = server.handle_request(make_request("ping", None, Some(1))).await.unwrap();
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn tools_call_memory_health_round_trips() {
        let mut server = test_server().await;
        server.handle_request(make_request("initialize", None, Some(1))).await;
        server.handle_request(make_request("notifications/initialized", None, None)).await;
        let params = json!({"name": "memory_health", "arguments": {}});
        let response = server.handle_request(make_request("tools/call", Some(params), Some(2))).await.unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["isError"], false);
    }
}

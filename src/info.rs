//! Discovery endpoint served at `GET /`

use crate::config::{ADAPTER_MESSAGE_PATH, ADAPTER_SSE_PATH};
use crate::routes::{RouteKind, RouteTable};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

const LOCAL_TOOLS_DESCRIPTION: &str = "Python MCP server for local tools";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayInfo {
    pub status: &'static str,
    #[serde(rename = "localTools")]
    pub local_tools: LocalToolsInfo,
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalToolsInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub sse: String,
    pub message: String,
}

impl GatewayInfo {
    /// Describe the routes currently registered in `table`
    pub fn from_routes(table: &RouteTable) -> Self {
        let mut local_tools = LocalToolsInfo {
            sse: None,
            message: None,
            description: LOCAL_TOOLS_DESCRIPTION,
        };
        let mut servers = Vec::new();

        for route in table.routes() {
            match &route.kind {
                RouteKind::Backend { name } => servers.push(ServerInfo {
                    name: name.clone(),
                    sse: format!("{}{}", route.prefix, ADAPTER_SSE_PATH),
                    message: format!("{}{}", route.prefix, ADAPTER_MESSAGE_PATH),
                }),
                RouteKind::LocalToolsEvents => {
                    local_tools.sse.get_or_insert_with(|| route.prefix.clone());
                }
                RouteKind::LocalToolsMessages => {
                    local_tools.message.get_or_insert_with(|| route.prefix.clone());
                }
            }
        }

        Self {
            status: "ok",
            local_tools,
            servers,
        }
    }
}

/// JSON response for the info endpoint
pub fn info_response(table: &RouteTable) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_string(&GatewayInfo::from_routes(table))
        .unwrap_or_else(|_| r#"{"status":"ok"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSpec;
    use crate::ports::PortAssignment;
    use crate::routes::Route;
    use std::collections::HashMap;

    fn assignment(name: &str, port: u16) -> PortAssignment {
        PortAssignment {
            spec: BackendSpec {
                name: name.to_string(),
                command: "npx".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
            },
            port,
        }
    }

    #[test]
    fn test_single_backend_info() {
        let table = RouteTable::build(&[assignment("weather", 8100)], 8000);
        let info = GatewayInfo::from_routes(&table);

        assert_eq!(info.status, "ok");
        assert_eq!(
            info.servers,
            vec![ServerInfo {
                name: "weather".to_string(),
                sse: "/weather/sse".to_string(),
                message: "/weather/message".to_string(),
            }]
        );
        assert_eq!(info.local_tools.sse.as_deref(), Some("/sse"));
        assert_eq!(info.local_tools.message.as_deref(), Some("/messages"));
    }

    #[test]
    fn test_servers_listed_in_route_order() {
        let table = RouteTable::build(&[assignment("a", 8100), assignment("b", 8101)], 8000);
        let names: Vec<String> = GatewayInfo::from_routes(&table)
            .servers
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_info_json_shape() {
        let table = RouteTable::build(&[assignment("weather", 8100)], 8000);
        let json = serde_json::to_value(GatewayInfo::from_routes(&table)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "status": "ok",
                "localTools": {
                    "sse": "/sse",
                    "message": "/messages",
                    "description": "Python MCP server for local tools"
                },
                "servers": [
                    {"name": "weather", "sse": "/weather/sse", "message": "/weather/message"}
                ]
            })
        );
    }

    #[test]
    fn test_table_without_local_tools_routes() {
        let table = RouteTable::new(vec![Route::backend("solo", 9000)]);
        let json = serde_json::to_value(GatewayInfo::from_routes(&table)).unwrap();

        assert!(json["localTools"].get("sse").is_none());
        assert_eq!(json["servers"][0]["name"], "solo");
    }

    #[test]
    fn test_info_response_headers() {
        let table = RouteTable::build(&[], 8000);
        let response = info_response(&table);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}

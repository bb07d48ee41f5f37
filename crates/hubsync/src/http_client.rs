//! 共享的 HTTP 客户端构造与响应检查
//!
//! 同步客户端、计费客户端、LFS 远端都走这里，超时统一来自 `HttpConfig`。

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::HttpConfig;
use crate::error::{HubSyncError, Result};

/// 按配置创建 reqwest 客户端
pub fn build_client(config: &HttpConfig) -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .user_agent(concat!("hubsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| HubSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;
    info!(
        "✅ HTTP 客户端已创建 (connect_timeout={}s, request_timeout={}s)",
        config.connect_timeout_secs, config.request_timeout_secs
    );
    Ok(client)
}

/// 非 2xx 响应转为 `Http { status, message }`
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "无法读取错误信息".to_string());
    debug!(%url, status = status.as_u16(), "HTTP 请求失败: {}", body);
    Err(HubSyncError::Http {
        status: status.as_u16(),
        message: format!("{} {}", url, body.chars().take(512).collect::<String>()),
    })
}

/// 检查状态并解析 JSON
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| HubSyncError::Serialization(format!("解析响应失败: {}", e)))
}

//! 统一错误体的提取器：解析失败时返回 `ApiError` 而不是 axum 默认的纯文本

use axum::extract::{FromRequest, FromRequestParts};

use crate::error::ApiError;

/// JSON 请求体
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// 路径参数
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

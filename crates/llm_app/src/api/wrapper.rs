use anyhow::Error;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::error::InnerApiError;
use crate::conversation::ConversationError;

/// 所有 JSON 接口统一的 `{status_code, data}` 外层结构
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T: Serialize> {
    status_code: u16,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { status_code: 200, data }
    }

    pub fn bad_request(data: T) -> Self {
        Self { status_code: 400, data }
    }

    pub fn not_found(data: T) -> Self {
        Self { status_code: 404, data }
    }

    pub fn internal_server_error(data: T) -> Self {
        Self { status_code: 500, data }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub struct ApiError(Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(value: E) -> Self {
        Self(value.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if let Some(inner_error) = self.0.downcast_ref::<InnerApiError>() {
            return match inner_error {
                InnerApiError::NotFound(_) => ApiResponse::not_found(self.0.to_string()).into_response(),
                InnerApiError::BadRequest(_) => ApiResponse::bad_request(self.0.to_string()).into_response(),
            };
        }
        if let Some(conversation_error) = self.0.downcast_ref::<ConversationError>() {
            match conversation_error {
                ConversationError::NotFound(_) => {
                    return ApiResponse::not_found(self.0.to_string()).into_response();
                }
                ConversationError::InvalidState(_) => {
                    return ApiResponse::bad_request(self.0.to_string()).into_response();
                }
                _ => {}
            }
        }
        tracing::error!("请求处理失败: {:#}", self.0);
        ApiResponse::internal_server_error(format!("{:#}", self.0)).into_response()
    }
}

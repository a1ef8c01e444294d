use axum::{
    async_trait,
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::AppError;

/// JSON body that has passed its `validator` rules
#[derive(Debug, Clone)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::InvalidInput(format!("Invalid JSON: {}", e.body_text())))?;

        value.validate().map_err(|e| {
            let errors = e
                .field_errors()
                .into_iter()
                .map(|(field, errors)| {
                    let messages: Vec<String> = errors
                        .iter()
                        .map(|e| {
                            e.message
                                .as_ref()
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| e.code.to_string())
                        })
                        .collect();
                    format!("{}: {}", field, messages.join(", "))
                })
                .collect::<Vec<String>>()
                .join("; ");

            AppError::InvalidInput(format!("Validation failed: {}", errors))
        })?;

        Ok(ValidatedJson(value))
    }
}

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::BindingView;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 100, message = "Display name must be 1-100 characters"))]
    #[schema(example = "Alice Example")]
    pub display_name: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    #[schema(min_length = 8)]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct DeleteAccountRequest {
    /// Must be the literal `DELETE`.
    #[schema(example = "DELETE")]
    pub confirmation: String,

    /// Required when the account has a local password.
    pub password: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LinkedProvidersResponse {
    pub providers: Vec<BindingView>,
}

pub mod password;
pub mod validation;

pub use password::{
    check_password_strength, generate_secret, generate_username, is_valid_protocol_username,
    Password,
};
pub use validation::ValidatedJson;

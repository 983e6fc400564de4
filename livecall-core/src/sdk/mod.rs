//! Clients for the business services around a call
//!
//! - [`CheckApi`]: optional permission checks before room actions
//! - [`PushApi`]: delivers call signals to users

pub mod check_api;
pub mod push_api;

pub use check_api::{CheckApi, HttpCheckApi};
pub use push_api::{HttpPushApi, LogPushApi, PushApi};

use std::time::Duration;

fn http_client(timeout: Duration) -> crate::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

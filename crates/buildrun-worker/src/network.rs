//! The HTTP session shared by every download of a run.

use std::time::Duration;

use crate::config::Preferences;
use crate::error::DownloadError;

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("buildrun/", env!("CARGO_PKG_VERSION"));

/// Build the reusable HTTP client. A timeout of 0 disables the connect
/// timeout.
pub fn http_client(prefs: &Preferences) -> Result<reqwest::Client, DownloadError> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if prefs.http_timeout_secs > 0 {
        builder = builder.connect_timeout(Duration::from_secs(prefs.http_timeout_secs));
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent() {
        assert!(USER_AGENT.starts_with("buildrun/"));
    }

    #[test]
    fn test_client_builds_with_and_without_timeout() {
        assert!(http_client(&Preferences::default()).is_ok());
        let prefs = Preferences {
            http_timeout_secs: 0,
            ..Preferences::default()
        };
        assert!(http_client(&prefs).is_ok());
    }
}

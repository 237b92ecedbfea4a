//! Shared secret presented to the dashboard on every connect.
//!
//! The token is sent once per websocket handshake in the `x-api-token`
//! header. It is fixed for the lifetime of the process: there is no
//! challenge/response and no refresh.

use std::{fmt, fs, str::FromStr};

use http::HeaderValue;
use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// Header the dashboard reads the token from.
pub const HEADER_NAME: &str = "x-api-token";

/// Shared secret for the dashboard websocket.
///
/// `Debug` output is redacted so the token can't leak into logs.
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
#[redact(all)]
pub struct ApiToken(String);

impl ApiToken {
    /// Secrets files are tiny; anything bigger is not what we're looking for.
    const MAX_FILE_SIZE: u64 = 1024;

    /// Reads the token from the `api_secret` key of a TOML secrets file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, is not
    /// valid TOML or holds no valid `api_secret`.
    pub fn from_file(path: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Secrets {
            api_secret: Option<String>,
        }

        let attributes = fs::metadata(path)?;
        let file_size = attributes.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{path} is too large ({file_size} bytes)"
            )));
        }

        let contents = fs::read_to_string(path)?;
        let secrets: Secrets = toml::from_str(&contents)?;
        match secrets.api_secret {
            Some(secret) => secret.parse(),
            None => Err(Error::not_found(format!("{path} does not contain an api_secret"))),
        }
    }

    /// Returns the token as a header value for the websocket handshake.
    ///
    /// # Errors
    ///
    /// Cannot fail for tokens built through [`FromStr`], which validates.
    pub fn header_value(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&self.0)?;
        value.set_sensitive(true);
        Ok(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ApiToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        if token.is_empty() {
            return Err(Error::unauthenticated("api token is empty"));
        }

        // Must survive as a header value, else every handshake fails.
        HeaderValue::from_str(token)?;

        Ok(Self(token.to_owned()))
    }
}

impl fmt::Display for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", "*".repeat(self.0.chars().count().min(8)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parse_trims_and_validates() {
        let token: ApiToken = "  s3cr3t \n".parse().unwrap();
        assert_eq!(token.as_str(), "s3cr3t");

        let err = "   ".parse::<ApiToken>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);

        assert!("line\nbreak".parse::<ApiToken>().is_err());
    }

    #[test]
    fn debug_and_display_are_redacted() {
        let token: ApiToken = "hunter2hunter2".parse().unwrap();
        assert!(!format!("{token:?}").contains("hunter2"));
        assert!(!token.to_string().contains("hunter2"));
    }

    #[test]
    fn header_value_is_sensitive() {
        let token: ApiToken = "abc".parse().unwrap();
        let value = token.header_value().unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().unwrap(), "abc");
    }

    #[test]
    fn reads_secrets_file() {
        let path = std::env::temp_dir().join(format!("dashlink-secrets-{}.toml", fastrand::u64(..)));
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "api_secret = \"from-file\"").unwrap();
        drop(file);

        let token = ApiToken::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(token.as_str(), "from-file");

        fs::write(&path, "other = 1\n").unwrap();
        let err = ApiToken::from_file(path.to_str().unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        fs::remove_file(&path).unwrap();
    }
}

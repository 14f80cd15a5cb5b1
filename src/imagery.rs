//! Authenticated access to the Mapillary graph API.
//!
//! Only the client setup lives here: the access token is read from the environment (or a `.env`
//! file) and baked into a [MapillaryClient]. Callers pass the client around explicitly.

extern crate dotenvy;
extern crate reqwest;

use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use std::time::Duration;

use crate::Error;

/// Environment variable holding the Mapillary access token.
pub const TOKEN_VAR: &str = "MAPILLARY_ACCESS_TOKEN";
pub const API_ROOT: &str = "https://graph.mapillary.com";

#[derive(Clone, PartialEq)]
pub struct Credentials {
    access_token: String,
}

// Keep the token out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(access_token: String) -> Self {
        Credentials {
            access_token: access_token,
        }
    }

    /// Load `.env` from the working directory (if there is one), then read the token from
    /// `MAPILLARY_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self, Error> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {}", path.display()),
            Err(e) => debug!("No .env file loaded: {}", e),
        }
        Credentials::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the token through `lookup`. A missing or blank token is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(TOKEN_VAR) {
            Some(token) if !token.trim().is_empty() => Ok(Credentials::new(token.trim().to_string())),
            _ => Err(Error::MissingEnv(TOKEN_VAR.to_string())),
        }
    }

    /// Headers sent with every API request.
    pub fn headers(&self) -> Result<HeaderMap, Error> {
        let mut value = HeaderValue::from_str(&format!("OAuth {}", self.access_token))
            .map_err(|_| Error::ParseError(format!("{} is not a valid header value", TOKEN_VAR)))?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }
}

/// HTTP client for the Mapillary API with authentication configured.
#[derive(Debug, Clone)]
pub struct MapillaryClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl MapillaryClient {
    pub fn new(credentials: &Credentials) -> Result<Self, Error> {
        MapillaryClient::with_base_url(credentials, API_ROOT)
    }

    pub fn with_base_url(credentials: &Credentials, base_url: &str) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .default_headers(credentials.headers()?)
            .timeout(Duration::from_secs(60))
            .build()?;
        info!("Mapillary client configured for {}", base_url);
        Ok(MapillaryClient {
            http: http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL of an API path such as `images` or `/images`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// The underlying client. Requests made with it carry the access token.
    pub fn http(&self) -> &reqwest::blocking::Client {
        &self.http
    }
}

#[test]
fn test_missing_token() {
    match Credentials::from_lookup(|_| None) {
        Err(Error::MissingEnv(var)) => assert_eq!(var, "MAPILLARY_ACCESS_TOKEN"),
        other => panic!("expected a missing variable, got {:?}", other),
    }
    assert!(matches!(
        Credentials::from_lookup(|_| Some("  ".to_string())),
        Err(Error::MissingEnv(_))
    ));
}

#[test]
fn test_auth_header() {
    let creds = Credentials::from_lookup(|var| {
        assert_eq!(var, TOKEN_VAR);
        Some("MLY|123|abc\n".to_string())
    })
    .unwrap();
    let headers = creds.headers().unwrap();
    assert_eq!(headers[AUTHORIZATION], "OAuth MLY|123|abc");
    assert!(!format!("{:?}", creds).contains("abc"));
}

#[test]
fn test_client_urls() {
    let creds = Credentials::new("token".to_string());
    let client = MapillaryClient::new(&creds).unwrap();
    assert_eq!(client.base_url(), "https://graph.mapillary.com");
    assert_eq!(client.url("/images"), "https://graph.mapillary.com/images");

    let local = MapillaryClient::with_base_url(&creds, "http://localhost:8080/").unwrap();
    assert_eq!(local.url("images"), "http://localhost:8080/images");
}

#[test]
fn test_invalid_token() {
    let creds = Credentials::new("bad\ntoken".to_string());
    assert!(matches!(creds.headers(), Err(Error::ParseError(_))));
}
